//! Downloader host pinning.

use std::net::IpAddr;
use std::sync::Mutex;

/// Remembers the first downloader host and rejects others.
#[derive(Debug, Default)]
pub struct HostPin {
    host: Mutex<Option<IpAddr>>,
}

impl HostPin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins to `host` on first use; afterwards admits only that host.
    pub fn admit(&self, host: IpAddr) -> bool {
        let mut pinned = self.host.lock().unwrap();
        match *pinned {
            Some(existing) => existing == host,
            None => {
                *pinned = Some(host);
                true
            }
        }
    }

    pub fn pinned(&self) -> Option<IpAddr> {
        *self.host.lock().unwrap()
    }
}
