//! Execution Timeline
//!
//! Records when each task attempt starts and finishes on which worker, for
//! Gantt charts and for checking how many tasks overlapped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::execution::task::TaskId;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Invocation started on a worker
    Started,
    /// Invocation exited with code 0
    Succeeded,
    /// Invocation failed (non-zero exit, spawn error, cancellation)
    Failed,
    /// Invocation was killed after its timeout
    TimedOut,
}

impl EventType {
    fn is_end(self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub task_id: TaskId,
    /// Worker that ran the attempt
    pub worker_id: usize,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Tracks task execution over time.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a task.
    pub fn add_event(&mut self, task_id: TaskId, worker_id: usize, event_type: EventType) {
        self.events.push(TimelineEvent {
            task_id,
            worker_id,
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Largest number of attempts that were executing at the same moment.
    pub fn peak_concurrency(&self) -> usize {
        let mut running = 0usize;
        let mut peak = 0usize;

        // Events are appended in time order under the pool lock
        for event in &self.events {
            if event.event_type.is_end() {
                running = running.saturating_sub(1);
            } else {
                running += 1;
                peak = peak.max(running);
            }
        }
        peak
    }

    /// Order in which tasks first started.
    pub fn start_order(&self) -> Vec<TaskId> {
        let mut seen = Vec::new();
        for event in &self.events {
            if event.event_type == EventType::Started && !seen.contains(&event.task_id) {
                seen.push(event.task_id);
            }
        }
        seen
    }

    /// Generates an ASCII Gantt chart, one bar per task attempt span.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.start_time.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut spans: Vec<(TaskId, usize, u128, u128)> = Vec::new();
        let mut open: HashMap<TaskId, (usize, u128)> = HashMap::new();

        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            if event.event_type == EventType::Started {
                open.insert(event.task_id, (event.worker_id, elapsed));
            } else if let Some((worker, start)) = open.remove(&event.task_id) {
                spans.push((event.task_id, worker, start, elapsed));
            }
        }

        spans.sort_by_key(|(_, _, start, _)| *start);

        for (task_id, worker, start, end) in spans {
            let start_pos = (start as f64 * scale) as usize;
            let width = (((end - start) as f64) * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{:12} w{:<2} |{}| ({} ms)\n",
                truncate(&task_id.to_string(), 12),
                worker,
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns the duration of the last completed attempt per task.
    pub fn get_durations(&self) -> HashMap<TaskId, Duration> {
        let mut starts: HashMap<TaskId, Instant> = HashMap::new();
        let mut durations = HashMap::new();

        for event in &self.events {
            if event.event_type == EventType::Started {
                starts.insert(event.task_id, event.timestamp);
            } else if let Some(start) = starts.get(&event.task_id) {
                durations.insert(event.task_id, event.timestamp.duration_since(*start));
            }
        }

        durations
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a string to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.get_events().is_empty());
        assert_eq!(timeline.peak_concurrency(), 0);
    }

    #[test]
    fn test_get_durations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event(TaskId(1), 0, EventType::Started);
        thread::sleep(Duration::from_millis(50));
        timeline.add_event(TaskId(1), 0, EventType::Succeeded);

        let durations = timeline.get_durations();
        assert!(durations[&TaskId(1)] >= Duration::from_millis(50));
    }

    #[test]
    fn test_durations_ignore_unfinished() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event(TaskId(1), 0, EventType::Started);
        assert!(timeline.get_durations().is_empty());
    }

    #[test]
    fn test_peak_concurrency() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event(TaskId(1), 0, EventType::Started);
        timeline.add_event(TaskId(2), 1, EventType::Started);
        timeline.add_event(TaskId(1), 0, EventType::Succeeded);
        timeline.add_event(TaskId(3), 0, EventType::Started);
        timeline.add_event(TaskId(4), 2, EventType::Started);
        timeline.add_event(TaskId(2), 1, EventType::TimedOut);
        timeline.add_event(TaskId(3), 0, EventType::Failed);
        timeline.add_event(TaskId(4), 2, EventType::Succeeded);

        assert_eq!(timeline.peak_concurrency(), 3);
    }

    #[test]
    fn test_start_order_dedups_retries() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event(TaskId(5), 0, EventType::Started);
        timeline.add_event(TaskId(5), 0, EventType::TimedOut);
        timeline.add_event(TaskId(2), 0, EventType::Started);
        timeline.add_event(TaskId(5), 1, EventType::Started);

        assert_eq!(timeline.start_order(), vec![TaskId(5), TaskId(2)]);
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();

        timeline.add_event(TaskId(1), 0, EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event(TaskId(1), 0, EventType::Succeeded);
        timeline.add_event(TaskId(2), 1, EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event(TaskId(2), 1, EventType::Failed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("task-1"));
        assert!(chart.contains("task-2"));
        assert!(chart.contains("w1"));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc  ");
        assert_eq!(truncate("abcdefghij", 6), "abc...");
    }
}
