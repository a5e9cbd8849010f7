// Evaluation watchdog
// Entry/exit observer that bounds evaluation depth and wall-clock time.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::ast::AstNode;
use crate::errors::{Error, Result};
use crate::frame::Frame;
use crate::value::JValue;

/// Observer called around every evaluation step. Returning an error aborts
/// the whole evaluation.
pub trait EvaluationHook {
    fn on_entry(&mut self, expr: &AstNode, input: &JValue, frame: &Frame) -> Result<()>;
    fn on_exit(&mut self, expr: &AstNode, input: &JValue, frame: &Frame, result: &JValue) -> Result<()>;
}

/// Limits applied to one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeBounds {
    pub timeout: Option<Duration>,
    pub max_depth: usize,
}

impl Default for RuntimeBounds {
    fn default() -> Self {
        RuntimeBounds {
            timeout: None,
            max_depth: 300,
        }
    }
}

impl RuntimeBounds {
    /// Bounds from a timeout in milliseconds and a maximum depth.
    pub fn new(timeout_ms: u64, max_depth: usize) -> Self {
        RuntimeBounds {
            timeout: Some(Duration::from_millis(timeout_ms)),
            max_depth,
        }
    }
}

/// Depth and time guard. Evaluations in a frame flagged parallel do not count
/// towards the depth; the decision taken at entry is replayed at exit.
#[derive(Debug)]
pub struct Watchdog {
    bounds: RuntimeBounds,
    started: Instant,
    depth: usize,
    counted: Vec<bool>,
}

impl Watchdog {
    pub fn new(bounds: RuntimeBounds) -> Self {
        Watchdog {
            bounds,
            started: Instant::now(),
            depth: 0,
            counted: Vec::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn check(&self, expr: &AstNode) -> Result<()> {
        if self.depth > self.bounds.max_depth {
            warn!(depth = self.depth, max_depth = self.bounds.max_depth, "evaluation depth exceeded");
            return Err(Error::at("U1001", expr.position));
        }
        if let Some(timeout) = self.bounds.timeout {
            let elapsed = self.started.elapsed();
            if elapsed > timeout {
                warn!(?elapsed, ?timeout, "evaluation timed out");
                return Err(Error::at("U1002", expr.position));
            }
        }
        Ok(())
    }
}

impl EvaluationHook for Watchdog {
    fn on_entry(&mut self, expr: &AstNode, _input: &JValue, frame: &Frame) -> Result<()> {
        let counted = !frame.is_parallel();
        self.counted.push(counted);
        if counted {
            self.depth += 1;
            self.check(expr)?;
        }
        Ok(())
    }

    fn on_exit(&mut self, expr: &AstNode, _input: &JValue, _frame: &Frame, _result: &JValue) -> Result<()> {
        if self.counted.pop().unwrap_or(false) {
            self.depth = self.depth.saturating_sub(1);
            self.check(expr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::NodeKind;

    fn node() -> AstNode {
        AstNode::new(NodeKind::Null, 0)
    }

    #[test]
    fn test_depth_is_balanced() {
        let mut watchdog = Watchdog::new(RuntimeBounds::default());
        let frame = Frame::root();
        for _ in 0..10 {
            watchdog.on_entry(&node(), &JValue::Undefined, &frame).unwrap();
        }
        assert_eq!(watchdog.depth(), 10);
        for _ in 0..10 {
            watchdog.on_exit(&node(), &JValue::Undefined, &frame, &JValue::Undefined).unwrap();
        }
        assert_eq!(watchdog.depth(), 0);
    }

    #[test]
    fn test_max_depth_trips() {
        let mut watchdog = Watchdog::new(RuntimeBounds { timeout: None, max_depth: 3 });
        let frame = Frame::root();
        for _ in 0..3 {
            watchdog.on_entry(&node(), &JValue::Undefined, &frame).unwrap();
        }
        let err = watchdog.on_entry(&node(), &JValue::Undefined, &frame).unwrap_err();
        assert_eq!(err.code, "U1001");
    }

    #[test]
    fn test_parallel_frames_are_not_counted() {
        let mut watchdog = Watchdog::new(RuntimeBounds { timeout: None, max_depth: 1 });
        let frame = Frame::root();
        frame.set_parallel(true);
        for _ in 0..5 {
            watchdog.on_entry(&node(), &JValue::Undefined, &frame).unwrap();
        }
        assert_eq!(watchdog.depth(), 0);
        // the flag changing before exit does not unbalance the counter
        frame.set_parallel(false);
        watchdog.on_exit(&node(), &JValue::Undefined, &frame, &JValue::Undefined).unwrap();
        assert_eq!(watchdog.depth(), 0);
    }

    #[test]
    fn test_timeout_trips() {
        let mut watchdog = Watchdog::new(RuntimeBounds::new(0, 100));
        std::thread::sleep(Duration::from_millis(5));
        let err = watchdog.on_entry(&node(), &JValue::Undefined, &Frame::root()).unwrap_err();
        assert_eq!(err.code, "U1002");
    }
}
