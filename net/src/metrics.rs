//! Reactor metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total connections accepted across all servers"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Connections currently established"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "loop_wakeups",
    description = "Cross-thread wakeups delivered to event loops"
)]
pub static LOOP_WAKEUPS: Counter = Counter::new();

#[metric(
    name = "loop_tasks_executed",
    description = "Queued tasks drained by event loops"
)]
pub static LOOP_TASKS_EXECUTED: Counter = Counter::new();

#[metric(
    name = "accept_emfile_recoveries",
    description = "Times the acceptor shed a connection to recover from fd exhaustion"
)]
pub static ACCEPT_EMFILE_RECOVERIES: Counter = Counter::new();
