//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;

use crate::scheduler::{Scheduler, SchedulerStats};

/// Collect all metrics from the scheduler and format as Prometheus text.
pub fn collect_metrics(scheduler: &Scheduler) -> String {
    let stats = scheduler.stats();
    let mut output = String::new();

    write_task_metrics(&stats, &mut output);
    write_worker_metrics(&stats, &mut output);
    write_resource_metrics(&stats, &mut output);

    output
}

/// Task counts by status.
fn write_task_metrics(stats: &SchedulerStats, output: &mut String) {
    writeln!(
        output,
        "# HELP foreman_tasks_total Total number of tasks by status"
    )
    .ok();
    writeln!(output, "# TYPE foreman_tasks_total gauge").ok();
    writeln!(
        output,
        "foreman_tasks_total{{status=\"unknown\"}} {}",
        stats.n_unknown
    )
    .ok();
    writeln!(
        output,
        "foreman_tasks_total{{status=\"pending\"}} {}",
        stats.n_pending
    )
    .ok();
    writeln!(
        output,
        "foreman_tasks_total{{status=\"running\"}} {}",
        stats.n_running
    )
    .ok();
    writeln!(output, "foreman_tasks_total{{status=\"done\"}} {}", stats.n_done).ok();
    writeln!(
        output,
        "foreman_tasks_total{{status=\"failed\"}} {}",
        stats.n_failed
    )
    .ok();
    writeln!(
        output,
        "foreman_tasks_total{{status=\"disabled\"}} {}",
        stats.n_disabled
    )
    .ok();
}

/// Connected worker count.
fn write_worker_metrics(stats: &SchedulerStats, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP foreman_workers_connected Number of workers seen within the disconnect timeout"
    )
    .ok();
    writeln!(output, "# TYPE foreman_workers_connected gauge").ok();
    writeln!(output, "foreman_workers_connected {}", stats.n_workers).ok();
}

/// Capacity and usage per configured or in-use resource.
fn write_resource_metrics(stats: &SchedulerStats, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP foreman_resource_capacity Configured capacity per resource"
    )
    .ok();
    writeln!(output, "# TYPE foreman_resource_capacity gauge").ok();
    for resource in &stats.resources {
        writeln!(
            output,
            "foreman_resource_capacity{{resource=\"{}\"}} {}",
            resource.name, resource.capacity
        )
        .ok();
    }

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP foreman_resource_in_use Units currently held by running tasks"
    )
    .ok();
    writeln!(output, "# TYPE foreman_resource_in_use gauge").ok();
    for resource in &stats.resources {
        writeln!(
            output,
            "foreman_resource_in_use{{resource=\"{}\"}} {}",
            resource.name, resource.in_use
        )
        .ok();
    }
}
