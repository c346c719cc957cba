//! Protobuf wire messages for the envelope.
//!
//! Equivalent schema:
//!
//! ```proto
//! message DataInMessage {
//!   bytes payload = 1;
//!   string resource_path = 2;
//!   string user_id = 3;
//!   TraceInfo trace_info = 4;
//! }
//!
//! message TraceInfo {
//!   oneof context {
//!     string propagation = 1;
//!     B3 b3 = 2;
//!   }
//! }
//!
//! message B3 {
//!   string trace_id = 1;
//!   string span_id = 2;
//!   string parent_span_id = 3;
//!   bool sampled = 4;
//!   bool debug = 5;
//! }
//! ```

#[derive(Clone, PartialEq, prost::Message)]
pub struct DataInMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub payload: bytes::Bytes,
    #[prost(string, tag = "2")]
    pub resource_path: String,
    #[prost(string, tag = "3")]
    pub user_id: String,
    #[prost(message, optional, tag = "4")]
    pub trace_info: Option<TraceInfo>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TraceInfo {
    #[prost(oneof = "trace_info::Context", tags = "1, 2")]
    pub context: Option<trace_info::Context>,
}

pub mod trace_info {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Context {
        #[prost(string, tag = "1")]
        Propagation(String),
        #[prost(message, tag = "2")]
        B3(super::B3),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct B3 {
    #[prost(string, tag = "1")]
    pub trace_id: String,
    #[prost(string, tag = "2")]
    pub span_id: String,
    #[prost(string, tag = "3")]
    pub parent_span_id: String,
    #[prost(bool, tag = "4")]
    pub sampled: bool,
    #[prost(bool, tag = "5")]
    pub debug: bool,
}
