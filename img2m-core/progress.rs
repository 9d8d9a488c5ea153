use log::info;
use std::sync::Mutex;

/// Width of the rendered bar in cells
pub const BAR_WIDTH: usize = 50;

/// Number of milestones a task is split into (20% steps)
const MILESTONES: usize = 5;

/// Render `task [█████▌    ] 40.0% (2/5)`
pub fn render_bar(task: &str, current: usize, total: usize, width: usize) -> String {
    if total == 0 {
        return format!("{} [{}] 0.0% (0/0)", task, " ".repeat(width));
    }

    let progress = current as f64 / total as f64;
    let filled = (progress * width as f64) as usize;

    let mut bar = String::with_capacity(width * 3);
    for i in 0..width {
        if i < filled {
            bar.push('█');
        } else if i == filled && progress > 0.0 {
            bar.push('▌');
        } else {
            bar.push(' ');
        }
    }

    format!("{} [{}] {:.1}% ({}/{})", task, bar, progress * 100.0, current, total)
}

#[derive(Debug, Default)]
struct ProgressState {
    processed: usize,
    last_milestone: usize,
}

/// Thread-safe milestone progress reporter.
///
/// A bar is logged every time the processed count crosses a 20% milestone
/// and once more when the task completes.
#[derive(Debug)]
pub struct ProgressTracker {
    task: String,
    total: usize,
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    pub fn new(task: impl Into<String>, total: usize) -> Self {
        Self {
            task: task.into(),
            total,
            state: Mutex::new(ProgressState::default()),
        }
    }

    /// Count one finished unit, returning the bar when one was emitted
    pub fn advance(&self) -> Option<String> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.processed += 1;
        if self.total == 0 {
            return None;
        }

        let milestone = state.processed * MILESTONES / self.total;
        if milestone > state.last_milestone || state.processed == self.total {
            state.last_milestone = milestone;
            let bar = render_bar(&self.task, state.processed, self.total, BAR_WIDTH);
            info!("{}", bar);
            return Some(bar);
        }
        None
    }

    pub fn processed(&self) -> usize {
        match self.state.lock() {
            Ok(guard) => guard.processed,
            Err(poisoned) => poisoned.into_inner().processed,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_render_partial_bar() {
        let bar = render_bar("Feature Extraction:", 2, 5, 10);
        assert_eq!(bar, "Feature Extraction: [████▌     ] 40.0% (2/5)");
    }

    #[test]
    fn test_render_complete_bar() {
        let bar = render_bar("Matching:", 3, 3, 4);
        assert_eq!(bar, "Matching: [████] 100.0% (3/3)");
    }

    #[test]
    fn test_milestones_are_reported_once() {
        let tracker = ProgressTracker::new("task", 10);
        let emitted: Vec<usize> = (1..=10)
            .filter_map(|i| tracker.advance().map(|_| i))
            .collect();
        assert_eq!(emitted, vec![2, 4, 6, 8, 10]);
    }

    #[test]
    fn test_small_task_reports_every_step() {
        let tracker = ProgressTracker::new("task", 3);
        let emitted = (0..3).filter(|_| tracker.advance().is_some()).count();
        assert_eq!(emitted, 3);
    }

    #[test]
    fn test_parallel_advance() {
        let tracker = ProgressTracker::new("task", 1000);
        (0..1000).into_par_iter().for_each(|_| {
            tracker.advance();
        });
        assert_eq!(tracker.processed(), 1000);
    }
}
