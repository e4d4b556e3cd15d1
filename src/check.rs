//! Scaffold consistency diagnostics.
//!
//! Run after detach (`check_torus`) or regen (`check_whole`) when the
//! inference configuration asks for it. Violations panic.

use crate::scaffold::Scaffold;
use crate::trace::Trace;

/// After detach: resampled nodes are inactive and every regen count is 0.
pub fn check_torus(trace: &Trace, scaffold: &Scaffold) {
    for (node, entry) in scaffold.drg() {
        assert_eq!(
            entry.regen_count, 0,
            "torus: node {} has regen count {}",
            node.0, entry.regen_count
        );
        if entry.resampled {
            assert!(
                !trace.is_active(node),
                "torus: resampled {} node {} is still active",
                trace.node(node).kind(),
                node.0
            );
        }
    }
}

/// After regen: every scaffold node is active and every resampled node has
/// been reached at least once.
pub fn check_whole(trace: &Trace, scaffold: &Scaffold) {
    for (node, entry) in scaffold.drg() {
        assert!(
            trace.is_active(node),
            "whole: {} node {} is inactive",
            trace.node(node).kind(),
            node.0
        );
        if entry.resampled {
            assert!(
                entry.regen_count > 0,
                "whole: resampled node {} has regen count 0",
                node.0
            );
        }
    }
}
