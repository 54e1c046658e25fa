#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WhitelistError {
    /// All slots are in use.
    Full,
    /// The port wasn't in the whitelist.
    NotFound,
    /// Port zero can't be whitelisted.
    InvalidPort,
}

/// A small set of destination ports, that bypass the session lookup.
pub struct WhitelistPorts<const PORTS: usize = 16> {
    ports: [u16; PORTS],
    len: usize,
}
impl<const PORTS: usize> WhitelistPorts<PORTS> {
    pub const fn new() -> Self {
        Self {
            ports: [0; PORTS],
            len: 0,
        }
    }
    /// Add a port.
    ///
    /// Adding a port twice is not an error.
    pub fn add(&mut self, port: u16) -> Result<(), WhitelistError> {
        if port == 0 {
            return Err(WhitelistError::InvalidPort);
        }
        if self.contains(port) {
            debug!("Port {} is already whitelisted.", port);
            return Ok(());
        }
        if self.len >= PORTS {
            return Err(WhitelistError::Full);
        }
        self.ports[self.len] = port;
        self.len += 1;
        Ok(())
    }
    /// Remove a port.
    ///
    /// Port zero is never whitelisted and removing it clears the entire set instead.
    pub fn remove(&mut self, port: u16) -> Result<(), WhitelistError> {
        if port == 0 {
            self.clear();
            return Ok(());
        }
        let index = self
            .ports()
            .iter()
            .position(|&candidate| candidate == port)
            .ok_or(WhitelistError::NotFound)?;
        // The order of the ports doesn't matter, so we fill the hole with the last port.
        self.ports[index] = self.ports[self.len - 1];
        self.len -= 1;
        Ok(())
    }
    pub fn clear(&mut self) {
        self.len = 0;
    }
    pub fn contains(&self, port: u16) -> bool {
        self.ports().contains(&port)
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// The port at `index`.
    pub fn get(&self, index: usize) -> Option<u16> {
        self.ports().get(index).copied()
    }
    pub fn ports(&self) -> &[u16] {
        &self.ports[..self.len]
    }
}
impl<const PORTS: usize> Default for WhitelistPorts<PORTS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_duplicates() {
        let mut whitelist = WhitelistPorts::<4>::new();
        whitelist.add(5001).unwrap();
        whitelist.add(5001).unwrap();
        assert_eq!(whitelist.len(), 1);
        assert_eq!(whitelist.get(0), Some(5001));
        assert_eq!(whitelist.get(1), None);
    }

    #[test]
    fn capacity() {
        let mut whitelist = WhitelistPorts::<2>::new();
        whitelist.add(1).unwrap();
        whitelist.add(2).unwrap();
        assert_eq!(whitelist.add(3), Err(WhitelistError::Full));
        // Re-adding a present port still works on a full set.
        assert_eq!(whitelist.add(2), Ok(()));
    }

    #[test]
    fn remove_fills_hole() {
        let mut whitelist = WhitelistPorts::<4>::new();
        for port in [80, 443, 8080] {
            whitelist.add(port).unwrap();
        }
        whitelist.remove(80).unwrap();
        assert_eq!(whitelist.ports(), &[8080, 443]);
        assert_eq!(whitelist.remove(80), Err(WhitelistError::NotFound));
        assert!(!whitelist.contains(80));
    }

    #[test]
    fn removing_port_zero_clears() {
        let mut whitelist = WhitelistPorts::<4>::new();
        whitelist.add(53).unwrap();
        whitelist.add(123).unwrap();
        whitelist.remove(0).unwrap();
        assert!(whitelist.is_empty());
        assert!(!whitelist.contains(0));
    }

    #[test]
    fn port_zero_is_rejected() {
        let mut whitelist = WhitelistPorts::<4>::new();
        assert_eq!(whitelist.add(0), Err(WhitelistError::InvalidPort));
        assert!(whitelist.is_empty());
        assert!(!whitelist.contains(0));
    }
}
