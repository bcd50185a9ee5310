//! Node.js side of the control-pipe protocol, passed to `node -e`.
//!
//! Needs a Node release with `--input-type=module` and top-level await.

pub const NODE_HARNESS: &str = include_str!("../harness/harness.mjs");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_uses_inherited_descriptors() {
        assert!(NODE_HARNESS.contains("new FrameReader(3, MAX_FRAME)"));
        assert!(NODE_HARNESS.contains("orderedWriter(4, MAX_FRAME)"));
    }

    #[test]
    fn harness_takes_frame_ceiling_from_host() {
        assert!(NODE_HARNESS.contains(crate::config::MAX_FRAME_ENV));
    }

    #[test]
    fn harness_exits_on_shutdown() {
        assert!(NODE_HARNESS.contains("process.exit(0)"));
    }
}
