//! Anchor correction: aligns the tracking frame with a server-resolved pose.
//!
//! The AR camera is a child of the anchor (the tracking origin). The server
//! answers for the camera pose captured at request time, so the correction is
//! computed in delta form against that snapshot, then the anchor is rotated
//! about the camera so the view does not swing while the heading changes.
//! Tracking keeps drifting while the request is in flight; the camera offset
//! accumulated since the snapshot is compensated when choosing the pivot.

use crate::config::CorrectionOptions;
use crate::types::{Localization, Pose};
use nalgebra::{Unit, UnitQuaternion, Vector3};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// The correction that was applied, in anchor (delta) form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    /// Anchor translation before the pivot rotation.
    pub position: Vector3<f64>,
    /// Euler delta [x, y, z] in degrees, after axis filtering.
    pub rotation: Vector3<f64>,
    /// Anchor transform the correction converges to.
    pub target: Pose,
    /// False when the target was applied immediately.
    pub animated: bool,
}

#[derive(Debug, Clone, Copy)]
struct Interpolation {
    start: Pose,
    target: Pose,
    progress: f64,
}

#[derive(Debug)]
struct Rig {
    /// Anchor transform in world space.
    anchor: Pose,
    /// Camera transform relative to the anchor.
    camera: Pose,
    animation: Option<Interpolation>,
}

impl Rig {
    fn camera_world(&self) -> Pose {
        Pose {
            position: self.anchor.position + self.anchor.rotation * self.camera.position,
            rotation: self.anchor.rotation * self.camera.rotation,
        }
    }

    fn rotate_anchor_around(&mut self, pivot: &Vector3<f64>, axis: Unit<Vector3<f64>>, degrees: f64) {
        let q = UnitQuaternion::from_axis_angle(&axis, degrees.to_radians());
        self.anchor.position = pivot + q * (self.anchor.position - pivot);
        self.anchor.rotation = q * self.anchor.rotation;
    }
}

/// Owns the anchor/camera rig shared between the localization loop and the renderer.
///
/// The renderer pushes the camera's tracking pose with [`set_camera_local`](Self::set_camera_local),
/// calls [`tick`](Self::tick) once per frame and reads [`anchor`](Self::anchor).
#[derive(Debug)]
pub struct PoseCorrector {
    options: Mutex<CorrectionOptions>,
    rig: Mutex<Rig>,
}

impl PoseCorrector {
    pub fn new(options: CorrectionOptions) -> Self {
        Self {
            options: Mutex::new(options),
            rig: Mutex::new(Rig {
                anchor: Pose::identity(),
                camera: Pose::identity(),
                animation: None,
            }),
        }
    }

    fn rig(&self) -> MutexGuard<'_, Rig> {
        self.rig.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> CorrectionOptions {
        *self.options.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_options(&self, options: CorrectionOptions) {
        *self.options.lock().unwrap_or_else(PoisonError::into_inner) = options;
    }

    /// Update the camera's pose relative to the anchor (the raw tracking pose).
    pub fn set_camera_local(&self, camera: Pose) {
        self.rig().camera = camera;
    }

    pub fn camera_local(&self) -> Pose {
        self.rig().camera
    }

    pub fn camera_world(&self) -> Pose {
        self.rig().camera_world()
    }

    pub fn anchor(&self) -> Pose {
        self.rig().anchor
    }

    pub fn is_animating(&self) -> bool {
        self.rig().animation.is_some()
    }

    /// Correct the anchor so the camera lands on `localization`'s absolute pose.
    ///
    /// Cancels any running animation. With `instantly`, or when the anchor
    /// would move further than `max_interpolation_distance`, the target is
    /// applied at once; otherwise [`tick`](Self::tick) animates towards it.
    pub fn apply(&self, localization: &Localization, instantly: bool) -> Correction {
        let options = self.options();
        let mut rig = self.rig();
        rig.animation = None;

        log::debug!(
            "Received localization position: {:?}, rotation: {:?}",
            localization.vps_position,
            localization.vps_rotation
        );

        let camera_offset = rig.camera.position - localization.tracking_position;

        // The camera child already carries the snapshot pose, subtract it.
        let mut position = localization.vps_position - localization.tracking_position;
        let mut rotation = localization.vps_rotation - localization.tracking_rotation;

        if options.freeze_y_pos {
            position.y = 0.0;
        }
        if options.rotate_only_y {
            rotation.x = 0.0;
            rotation.z = 0.0;
        }

        let start = rig.anchor;

        rig.anchor = Pose::new(position, UnitQuaternion::identity());
        let pivot = rig.camera_world().position - camera_offset;
        rig.rotate_anchor_around(&pivot, Vector3::z_axis(), rotation.z);
        rig.rotate_anchor_around(&pivot, Vector3::x_axis(), rotation.x);
        rig.rotate_anchor_around(&pivot, Vector3::y_axis(), rotation.y);

        let target = rig.anchor;
        let distance = (target.position - start.position).norm();
        let animated = !instantly && distance <= options.max_interpolation_distance;

        if animated {
            rig.anchor = start;
            rig.animation = Some(Interpolation {
                start,
                target,
                progress: 0.0,
            });
        }

        log::debug!(
            "Corrected localization position: {:?}, rotation: {:?} (animated: {})",
            position,
            rotation,
            animated
        );

        Correction {
            position,
            rotation,
            target,
            animated,
        }
    }

    /// Advance a running animation by `dt`. Returns true while still animating.
    pub fn tick(&self, dt: Duration) -> bool {
        let lerp_speed = self.options().lerp_speed;
        let mut rig = self.rig();
        let Some(mut anim) = rig.animation else {
            return false;
        };

        anim.progress = (anim.progress + lerp_speed * dt.as_secs_f64()).min(1.0);
        let t = anim.progress;
        rig.anchor = Pose {
            position: anim.start.position.lerp(&anim.target.position, t),
            rotation: anim
                .start
                .rotation
                .try_slerp(&anim.target.rotation, t, 1.0e-9)
                .unwrap_or(anim.target.rotation),
        };

        if t >= 1.0 {
            rig.anchor = anim.target;
            rig.animation = None;
            false
        } else {
            rig.animation = Some(anim);
            true
        }
    }

    /// Return anchor and camera to the identity transform.
    pub fn reset(&self) {
        let mut rig = self.rig();
        rig.animation = None;
        rig.anchor = Pose::identity();
        rig.camera = Pose::identity();
    }
}

impl Default for PoseCorrector {
    fn default() -> Self {
        Self::new(CorrectionOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{euler_to_quaternion, quaternion_to_euler};

    fn localization(
        vps_position: Vector3<f64>,
        vps_rotation: Vector3<f64>,
        tracking_position: Vector3<f64>,
        tracking_rotation: Vector3<f64>,
    ) -> Localization {
        Localization {
            vps_position,
            vps_rotation,
            tracking_position,
            tracking_rotation,
            location_id: "office".into(),
        }
    }

    fn options(freeze_y_pos: bool, rotate_only_y: bool) -> CorrectionOptions {
        CorrectionOptions {
            freeze_y_pos,
            rotate_only_y,
            ..CorrectionOptions::default()
        }
    }

    #[test]
    fn test_freeze_y_zeroes_vertical_component() {
        let corrector = PoseCorrector::new(options(true, true));
        let loc = localization(
            Vector3::new(1.0, 2.0, 3.0),
            Vector3::new(0.0, 90.0, 0.0),
            Vector3::zeros(),
            Vector3::zeros(),
        );
        let c = corrector.apply(&loc, true);
        assert_eq!(c.position, Vector3::new(1.0, 0.0, 3.0));
        assert_eq!(c.rotation, Vector3::new(0.0, 90.0, 0.0));
    }

    #[test]
    fn test_rotate_only_y_drops_pitch_and_roll() {
        let corrector = PoseCorrector::new(options(false, true));
        let loc = localization(
            Vector3::zeros(),
            Vector3::new(20.0, 50.0, 10.0),
            Vector3::zeros(),
            Vector3::new(5.0, 10.0, 5.0),
        );
        let c = corrector.apply(&loc, true);
        assert_eq!(c.rotation, Vector3::new(0.0, 40.0, 0.0));
    }

    #[test]
    fn test_camera_lands_on_absolute_pose() {
        let corrector = PoseCorrector::new(options(false, true));
        let tracking_position = Vector3::new(1.0, 0.0, 2.0);
        let tracking_rotation = Vector3::new(0.0, 30.0, 0.0);
        corrector.set_camera_local(Pose::new(
            tracking_position,
            euler_to_quaternion(&tracking_rotation),
        ));

        let loc = localization(
            Vector3::new(10.0, 0.0, 5.0),
            Vector3::new(0.0, 120.0, 0.0),
            tracking_position,
            tracking_rotation,
        );
        corrector.apply(&loc, true);

        let camera = corrector.camera_world();
        assert!((camera.position - Vector3::new(10.0, 0.0, 5.0)).norm() < 1e-9);
        let yaw = quaternion_to_euler(&camera.rotation).y;
        assert!((yaw - 120.0).abs() < 1e-6, "yaw = {}", yaw);
    }

    #[test]
    fn test_drift_since_snapshot_is_preserved() {
        let corrector = PoseCorrector::new(options(false, true));
        // Camera moved 0.5 m along x after the snapshot was taken.
        corrector.set_camera_local(Pose::new(Vector3::new(0.5, 0.0, 0.0), UnitQuaternion::identity()));

        let loc = localization(
            Vector3::new(3.0, 0.0, 4.0),
            Vector3::new(0.0, 90.0, 0.0),
            Vector3::zeros(),
            Vector3::zeros(),
        );
        corrector.apply(&loc, true);

        // The drift is carried into the corrected frame, rotated by the heading change.
        let camera = corrector.camera_world();
        let expected = Vector3::new(3.0, 0.0, 4.0)
            + euler_to_quaternion(&Vector3::new(0.0, 90.0, 0.0)) * Vector3::new(0.5, 0.0, 0.0);
        assert!((camera.position - expected).norm() < 1e-9);
    }

    #[test]
    fn test_small_correction_is_animated() {
        let corrector = PoseCorrector::new(options(false, true));
        let loc = localization(
            Vector3::new(2.0, 0.0, 0.0),
            Vector3::zeros(),
            Vector3::zeros(),
            Vector3::zeros(),
        );
        let c = corrector.apply(&loc, false);
        assert!(c.animated);
        assert_eq!(corrector.anchor().position, Vector3::zeros());

        // lerp_speed 2.0: a quarter second is halfway.
        assert!(corrector.tick(Duration::from_millis(250)));
        assert!((corrector.anchor().position - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-9);

        assert!(!corrector.tick(Duration::from_millis(300)));
        assert!(!corrector.is_animating());
        assert!((corrector.anchor().position - c.target.position).norm() < 1e-12);
    }

    #[test]
    fn test_large_jump_is_instant() {
        let corrector = PoseCorrector::new(options(false, true));
        let loc = localization(
            Vector3::new(50.0, 0.0, 0.0),
            Vector3::zeros(),
            Vector3::zeros(),
            Vector3::zeros(),
        );
        let c = corrector.apply(&loc, false);
        assert!(!c.animated);
        assert_eq!(corrector.anchor().position, Vector3::new(50.0, 0.0, 0.0));
        assert!(!corrector.tick(Duration::from_millis(16)));
    }

    #[test]
    fn test_new_correction_cancels_animation() {
        let corrector = PoseCorrector::new(options(false, true));
        let first = localization(
            Vector3::new(2.0, 0.0, 0.0),
            Vector3::zeros(),
            Vector3::zeros(),
            Vector3::zeros(),
        );
        corrector.apply(&first, false);
        corrector.tick(Duration::from_millis(250));

        let second = localization(
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::zeros(),
            Vector3::zeros(),
            Vector3::zeros(),
        );
        corrector.apply(&second, true);
        assert!(!corrector.is_animating());
        assert_eq!(corrector.anchor().position, Vector3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn test_reset_returns_to_identity() {
        let corrector = PoseCorrector::default();
        corrector.set_camera_local(Pose::new(Vector3::new(1.0, 1.0, 1.0), UnitQuaternion::identity()));
        let loc = localization(
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 45.0, 0.0),
            Vector3::zeros(),
            Vector3::zeros(),
        );
        corrector.apply(&loc, false);
        corrector.reset();
        assert_eq!(corrector.anchor(), Pose::identity());
        assert_eq!(corrector.camera_local(), Pose::identity());
        assert!(!corrector.is_animating());
    }
}
