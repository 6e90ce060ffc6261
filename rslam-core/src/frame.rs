use std::collections::{HashMap, HashSet};

use crate::geometry::{identity_pose, inv_se3, Pose};
use crate::{Id, Keypoint};

/// A frame produced on every tick. Only frames promoted to keyframes persist
/// in the map store; all others exist solely as "the current frame"
/// (`spec.md` §3 Lifecycles).
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: Id,
    /// The keyframe this frame is tracked against (its own sequence number,
    /// if this frame has itself been promoted; otherwise the most recent
    /// keyframe's sequence number; `None` before any keyframe exists).
    pub kfid: Option<Id>,

    pub wc: Pose,
    pub cw: Pose,

    pub keypoints: HashMap<Id, Keypoint>,

    pub nb_keypoints: usize,
    pub nb_2d_kpts: usize,
    pub nb_3d_kpts: usize,
    pub nb_stereo_kpts: usize,

    pub covisibility: HashMap<Id, usize>,
    pub local_map_ids: HashSet<Id>,
}

impl Frame {
    pub fn new(id: Id, kfid: Option<Id>) -> Self {
        Self {
            id,
            kfid,
            wc: identity_pose(),
            cw: identity_pose(),
            keypoints: HashMap::new(),
            nb_keypoints: 0,
            nb_2d_kpts: 0,
            nb_3d_kpts: 0,
            nb_stereo_kpts: 0,
            covisibility: HashMap::new(),
            local_map_ids: HashSet::new(),
        }
    }

    pub fn set_wc(&mut self, wc: Pose) {
        self.wc = wc;
        self.cw = inv_se3(&wc);
    }

    pub fn set_cw(&mut self, cw: Pose) {
        self.cw = cw;
        self.wc = inv_se3(&cw);
    }

    pub fn insert_keypoint(&mut self, kp: Keypoint) {
        self.keypoints.insert(kp.id, kp);
        self.recount();
    }

    pub fn remove_keypoint(&mut self, id: Id) -> Option<Keypoint> {
        let removed = self.keypoints.remove(&id);
        self.recount();
        removed
    }

    /// Recomputes the aggregated counters from the current keypoint set.
    /// Invariant (`spec.md` §3): `nb_keypoints == nb_2d_kpts + nb_3d_kpts`.
    pub fn recount(&mut self) {
        self.nb_2d_kpts = self.keypoints.values().filter(|k| !k.is_3d).count();
        self.nb_3d_kpts = self.keypoints.values().filter(|k| k.is_3d).count();
        self.nb_keypoints = self.nb_2d_kpts + self.nb_3d_kpts;
        self.nb_stereo_kpts = self.keypoints.values().filter(|k| k.is_stereo()).count();
        debug_assert!(self.nb_stereo_kpts <= self.nb_keypoints);
    }
}
