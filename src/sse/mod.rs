//! SSE bridge: wire parsing on ingest, ordered reassembly in the middle,
//! standard-format re-streaming on egress.

pub mod egress;
pub mod parser;
pub mod reassembly;
