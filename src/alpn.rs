//! Application-layer protocol ids known to the engine.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlpnProto {
    Http1,
    Http2,
    Http3,
    Imap,
    Pop3,
    Smb2,
    Turn,
    XmppClient,
    XmppServer,
    Sip2,
    Tds8,
}

const ALL: [AlpnProto; 11] = [
    AlpnProto::Http1,
    AlpnProto::Http2,
    AlpnProto::Http3,
    AlpnProto::Imap,
    AlpnProto::Pop3,
    AlpnProto::Smb2,
    AlpnProto::Turn,
    AlpnProto::XmppClient,
    AlpnProto::XmppServer,
    AlpnProto::Sip2,
    AlpnProto::Tds8,
];

impl AlpnProto {
    /// Protocol id as sent on the wire.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            AlpnProto::Http1 => b"http/1.1",
            AlpnProto::Http2 => b"h2",
            AlpnProto::Http3 => b"h3",
            AlpnProto::Imap => b"imap",
            AlpnProto::Pop3 => b"pop3",
            AlpnProto::Smb2 => b"smb2",
            AlpnProto::Turn => b"stun.turn",
            AlpnProto::XmppClient => b"xmpp-client",
            AlpnProto::XmppServer => b"xmpp-server",
            AlpnProto::Sip2 => b"sip/2",
            AlpnProto::Tds8 => b"tds/8.0",
        }
    }

    /// Look up a negotiated protocol by its wire id.
    pub fn from_bytes(id: &[u8]) -> Option<AlpnProto> {
        ALL.iter().copied().find(|p| p.as_bytes() == id)
    }

    /// Wire ids for a list of protocols, in preference order.
    pub fn wire_list(protos: &[AlpnProto]) -> Vec<Vec<u8>> {
        protos.iter().map(|p| p.as_bytes().to_vec()).collect()
    }
}

impl fmt::Display for AlpnProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}
