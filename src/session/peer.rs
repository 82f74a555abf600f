use std::net::SocketAddr;

/// Data port address paired with a control port address
#[must_use]
pub fn data_addr_for(control: SocketAddr) -> SocketAddr {
    SocketAddr::new(control.ip(), control.port().wrapping_add(1))
}

/// Remote end of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Control port address
    pub control_addr: SocketAddr,
    /// Data port address
    pub data_addr: SocketAddr,
    /// Peer SSRC, known once it answered or invited
    pub ssrc: Option<u32>,
    /// Announced session name
    pub name: Option<String>,
    /// Token of the invitation this session was opened with
    pub token: u32,
}

impl Peer {
    /// Peer at `control_addr`, with the data port at the next port
    #[must_use]
    pub fn new(control_addr: SocketAddr, token: u32) -> Self {
        Self {
            control_addr,
            data_addr: data_addr_for(control_addr),
            ssrc: None,
            name: None,
            token,
        }
    }

    /// Name if announced, otherwise the control address
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.control_addr.to_string())
    }
}
