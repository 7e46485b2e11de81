//! Culler statistics.

use std::time::Duration;

/// Counters kept by an [`InstancedCuller`](super::InstancedCuller).
///
/// Host-side only: the visible count lives on the device and is never read
/// back, so nothing here reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CullStats {
    /// Frames submitted.
    pub frames_drawn: u64,
    /// Frames skipped because the culler could not initialize.
    pub frames_skipped: u64,
    /// Frames whose submission failed.
    pub submission_failures: u64,
    /// Successful initializations.
    pub initializations: u32,
    /// Releases that freed buffers.
    pub releases: u32,
    /// Instances in the current pool.
    pub instance_count: u32,
    /// Workgroups per dispatch.
    pub groups_per_dispatch: u32,
    /// Device memory held by the three buffers.
    pub resident_bytes: u64,
    /// Host time spent recording and submitting the last frame.
    pub last_frame_cpu: Duration,
}

impl CullStats {
    /// Average frames per second implied by the last frame's host time.
    #[must_use]
    pub fn host_fps(&self) -> f32 {
        let seconds = self.last_frame_cpu.as_secs_f32();
        if seconds > 0.0 {
            1.0 / seconds
        } else {
            0.0
        }
    }

    /// Share of frames that were drawn.
    #[must_use]
    pub fn draw_ratio(&self) -> f32 {
        let total = self.frames_drawn + self.frames_skipped + self.submission_failures;
        if total == 0 {
            0.0
        } else {
            self.frames_drawn as f32 / total as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratios() {
        let stats = CullStats {
            frames_drawn: 3,
            frames_skipped: 1,
            last_frame_cpu: Duration::from_millis(4),
            ..CullStats::default()
        };
        assert!((stats.draw_ratio() - 0.75).abs() < f32::EPSILON);
        assert!((stats.host_fps() - 250.0).abs() < 0.01);
        assert_eq!(CullStats::default().draw_ratio(), 0.0);
        assert_eq!(CullStats::default().host_fps(), 0.0);
    }
}
