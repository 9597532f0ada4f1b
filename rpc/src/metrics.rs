//! RPC-layer metrics.

use metriken::{metric, Counter};

#[metric(
    name = "rpc_codec_errors",
    description = "Frames rejected by length, tag, checksum, or parse checks"
)]
pub static CODEC_ERRORS: Counter = Counter::new();

#[metric(name = "rpc_calls_sent", description = "Outbound calls issued")]
pub static CALLS_SENT: Counter = Counter::new();

#[metric(
    name = "rpc_requests_dispatched",
    description = "Inbound requests routed to a registered service"
)]
pub static REQUESTS_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "rpc_dispatch_failures",
    description = "Inbound requests answered with an error envelope"
)]
pub static DISPATCH_FAILURES: Counter = Counter::new();

#[metric(
    name = "rpc_responses_matched",
    description = "Responses correlated to an outstanding call"
)]
pub static RESPONSES_MATCHED: Counter = Counter::new();

#[metric(
    name = "rpc_orphan_responses",
    description = "Responses whose id matched no outstanding call"
)]
pub static ORPHAN_RESPONSES: Counter = Counter::new();
