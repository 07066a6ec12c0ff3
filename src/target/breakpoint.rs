//! Software breakpoint bookkeeping.
//!
//! A breakpoint is one patched byte: the original instruction byte is saved
//! and replaced with INT3. The actual poking lives in
//! [`process`](super::process); this module only tracks which addresses are
//! patched and what they held before.

use std::collections::HashMap;

/// x86 INT3 opcode.
pub const INT3: u8 = 0xcc;

#[derive(Debug, Clone, Copy)]
pub struct Breakpoint {
    pub address: u64,
    pub saved_byte: u8,
    pub enabled: bool,
}

/// All breakpoints installed in the target, keyed by runtime address.
#[derive(Debug, Default)]
pub struct BreakpointSet {
    by_address: HashMap<u64, Breakpoint>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: u64, saved_byte: u8) {
        self.by_address.insert(
            address,
            Breakpoint {
                address,
                saved_byte,
                enabled: true,
            },
        );
    }

    pub fn contains(&self, address: u64) -> bool {
        self.by_address.contains_key(&address)
    }

    pub fn is_enabled(&self, address: u64) -> bool {
        self.by_address
            .get(&address)
            .map(|bp| bp.enabled)
            .unwrap_or(false)
    }

    pub fn get(&self, address: u64) -> Option<&Breakpoint> {
        self.by_address.get(&address)
    }

    pub fn set_enabled(&mut self, address: u64, enabled: bool) -> Option<&Breakpoint> {
        let bp = self.by_address.get_mut(&address)?;
        bp.enabled = enabled;
        Some(bp)
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_saved_byte_and_enablement() {
        let mut set = BreakpointSet::new();
        set.insert(0x401000, 0x55);
        assert!(set.contains(0x401000));
        assert!(set.is_enabled(0x401000));
        assert_eq!(set.get(0x401000).unwrap().saved_byte, 0x55);

        set.set_enabled(0x401000, false);
        assert!(!set.is_enabled(0x401000));
        assert!(set.contains(0x401000));
        assert!(!set.is_enabled(0xdead), "unknown address is never enabled");
    }
}
