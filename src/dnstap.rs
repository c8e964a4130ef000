//! The dnstap record schema, hand-declared with explicit field tags so the
//! encoded form stays bit-compatible with `dnstap.proto`. The session layer
//! treats the encoded record as an opaque blob; only the three operations
//! from [`prost::Message`] (`encoded_len`, `encode`, `decode`) are consumed
//! by the encoder and decoder.

/// The content type string declared in READY, ACCEPT and START control
/// frames. A session is only valid if both sides declare it.
pub const PROTOBUF_CONTENT_TYPE: &[u8] = b"protobuf:dnstap.Dnstap";

/// One unit of DNS telemetry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Dnstap {
    /// Identity of the program that generated the record.
    #[prost(bytes = "vec", optional, tag = "1")]
    pub identity: Option<Vec<u8>>,

    /// Version of the program that generated the record.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub version: Option<Vec<u8>>,

    /// Extra data attached by the operator, opaque to consumers.
    #[prost(bytes = "vec", optional, tag = "3")]
    pub extra: Option<Vec<u8>>,

    #[prost(message, optional, tag = "14")]
    pub message: Option<Message>,

    #[prost(enumeration = "DnstapType", tag = "15")]
    pub r#type: i32,
}

impl Dnstap {
    /// A MESSAGE record wrapping `message`.
    pub fn from_message(message: Message) -> Self {
        Dnstap {
            r#type: DnstapType::Message as i32,
            message: Some(message),
            ..Default::default()
        }
    }

    pub fn with_identity(mut self, identity: impl Into<Vec<u8>>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<Vec<u8>>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DnstapType {
    Unknown = 0,
    Message = 1,
}

/// A DNS message observation: where it was captured, over which transport,
/// when, and the DNS wire payloads themselves.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,

    #[prost(enumeration = "SocketFamily", optional, tag = "2")]
    pub socket_family_raw: Option<i32>,

    #[prost(enumeration = "SocketProtocol", optional, tag = "3")]
    pub socket_protocol_raw: Option<i32>,

    /// Network-order address bytes (4 for INET, 16 for INET6).
    #[prost(bytes = "vec", optional, tag = "4")]
    pub query_address: Option<Vec<u8>>,

    #[prost(bytes = "vec", optional, tag = "5")]
    pub response_address: Option<Vec<u8>>,

    #[prost(uint32, optional, tag = "6")]
    pub query_port: Option<u32>,

    #[prost(uint32, optional, tag = "7")]
    pub response_port: Option<u32>,

    #[prost(uint64, optional, tag = "8")]
    pub query_time_sec: Option<u64>,

    #[prost(fixed32, optional, tag = "9")]
    pub query_time_nsec: Option<u32>,

    /// Verbatim DNS query message from the wire.
    #[prost(bytes = "vec", optional, tag = "10")]
    pub query_message: Option<Vec<u8>>,

    /// Query zone in DNS wire format (uncompressed).
    #[prost(bytes = "vec", optional, tag = "11")]
    pub query_zone: Option<Vec<u8>>,

    #[prost(uint64, optional, tag = "12")]
    pub response_time_sec: Option<u64>,

    #[prost(fixed32, optional, tag = "13")]
    pub response_time_nsec: Option<u32>,

    /// Verbatim DNS response message from the wire.
    #[prost(bytes = "vec", optional, tag = "14")]
    pub response_message: Option<Vec<u8>>,

    #[prost(message, optional, tag = "17")]
    pub policy: Option<Policy>,
}

impl Message {
    pub fn new(message_type: MessageType) -> Self {
        Message {
            r#type: message_type as i32,
            ..Default::default()
        }
    }

    pub fn socket_family(&self) -> Option<SocketFamily> {
        self.socket_family_raw.and_then(|v| SocketFamily::try_from(v).ok())
    }

    pub fn socket_protocol(&self) -> Option<SocketProtocol> {
        self.socket_protocol_raw.and_then(|v| SocketProtocol::try_from(v).ok())
    }
}

/// Details about a DNS filtering decision that led to this record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Policy {
    /// Free-form name of the policy type (e.g. the RPZ zone name).
    #[prost(string, optional, tag = "1")]
    pub r#type: Option<String>,

    #[prost(bytes = "vec", optional, tag = "2")]
    pub rule: Option<Vec<u8>>,

    #[prost(enumeration = "PolicyAction", optional, tag = "3")]
    pub action: Option<i32>,

    #[prost(enumeration = "PolicyMatch", optional, tag = "4")]
    pub r#match: Option<i32>,

    #[prost(bytes = "vec", optional, tag = "5")]
    pub value: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Unknown = 0,
    AuthQuery = 1,
    AuthResponse = 2,
    ResolverQuery = 3,
    ResolverResponse = 4,
    ClientQuery = 5,
    ClientResponse = 6,
    ForwarderQuery = 7,
    ForwarderResponse = 8,
    StubQuery = 9,
    StubResponse = 10,
    ToolQuery = 11,
    ToolResponse = 12,
    UpdateQuery = 13,
    UpdateResponse = 14,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SocketFamily {
    Unknown = 0,
    Inet = 1,
    Inet6 = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SocketProtocol {
    Unknown = 0,
    Udp = 1,
    Tcp = 2,
    Dot = 3,
    Doh = 4,
    DnscryptUdp = 5,
    DnscryptTcp = 6,
    Doq = 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PolicyAction {
    Unknown = 0,
    Nxdomain = 1,
    Nodata = 2,
    Pass = 3,
    Drop = 4,
    Truncate = 5,
    LocalData = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PolicyMatch {
    Unknown = 0,
    Qname = 1,
    ClientIp = 2,
    ResponseIp = 3,
    NsName = 4,
    NsIp = 5,
}
