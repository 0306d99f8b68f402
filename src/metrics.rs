// Copyright 2023 TiKV Project Authors. Licensed under Apache-2.0.

use lazy_static::lazy_static;
use prometheus::*;

/// The status of a task.
/// The ordering of this implies the priority for presenting to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running = 0,
    Paused,
    Error,
}

pub fn update_task_status(status: TaskStatus, task: &str) {
    let g = TASK_STATUS.with_label_values(&[task]);
    if g.get() < status as _ || status == TaskStatus::Running {
        g.set(status as _);
    }
}

lazy_static! {
    pub static ref ADVANCER_ERROR: IntCounterVec = register_int_counter_vec!(
        "log_backup_advancer_errors",
        "The errors met while advancing the checkpoint.",
        &["type"]
    )
    .unwrap();
    pub static ref CHECKPOINT_TS: IntGaugeVec = register_int_gauge_vec!(
        "log_backup_advancer_checkpoint_ts",
        "The published global checkpoint ts of the task.",
        &["task"]
    )
    .unwrap();
    pub static ref TICK_DURATION: HistogramVec = register_histogram_vec!(
        "log_backup_advancer_tick_duration_sec",
        "The time cost of the stages of one tick.",
        &["step"],
        exponential_buckets(0.001, 2.0, 16).unwrap()
    )
    .unwrap();
    pub static ref COLLECT_FAILURE: IntCounterVec = register_int_counter_vec!(
        "log_backup_advancer_collect_failures",
        "The per-store failures met while collecting region checkpoints.",
        &["reason"]
    )
    .unwrap();
    pub static ref SUBSCRIPTION_EVENT: IntCounterVec = register_int_counter_vec!(
        "log_backup_advancer_subscription_events",
        "The flush events received from the store subscriptions.",
        &["type"]
    )
    .unwrap();
    pub static ref OWNER: IntGauge = register_int_gauge!(
        "log_backup_advancer_owner",
        "Whether this instance currently owns the advancing duty."
    )
    .unwrap();
    pub static ref IN_RESOLVING_LOCK: IntGauge = register_int_gauge!(
        "log_backup_advancer_resolving_lock",
        "Whether a lock resolution pass is running."
    )
    .unwrap();
    static ref TASK_STATUS: IntGaugeVec = register_int_gauge_vec!(
        "log_backup_advancer_task_status",
        "The status of tasks.",
        &["task"]
    )
    .unwrap();
}
