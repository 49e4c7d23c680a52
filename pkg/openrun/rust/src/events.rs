// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::health::ProbeOutcome;
use crate::process::ExitInfo;
use tokio::sync::mpsc;

/// Messages delivered to the supervisor control loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// Result of one health probe against a given launch of a workload.
    Probe {
        workload: String,
        generation: u64,
        outcome: ProbeOutcome,
    },
    /// The process of a given launch has exited.
    Exited {
        workload: String,
        generation: u64,
        exit: ExitInfo,
    },
    /// A scheduled restart is due, unless the ticket has since been invalidated.
    RestartDue { workload: String, ticket: u64 },
    /// The router could not reach the workload; probe it now.
    Recheck { workload: String },
}

pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;

pub const EVENT_QUEUE_CAPACITY: usize = 256;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_QUEUE_CAPACITY)
}
