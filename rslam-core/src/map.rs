use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use sophus::nalgebra::{Point2, Vector3};

use crate::geometry::{from_homogeneous, to_homogeneous};
use crate::{Camera, Frame, Id, Keypoint, MapPoint};

struct MapInner {
    next_frame_id: Id,
    next_kfid: Id,
    current_frame: Frame,
    /// Persisted keyframes, keyed by keyframe sequence id: a dedicated
    /// 0-based counter, not the originating frame's own `id` (`spec.md` §3's
    /// "keyframe ids form a prefix-like subset of frame ids" is read here as
    /// an order-preserving compaction — see the "kfid numbering" note in
    /// DESIGN.md's `rslam-core` section for the reasoning and its tradeoff).
    keyframes: BTreeMap<Id, Frame>,
    /// Index from a keyframe's originating frame id back to its kfid, so a
    /// promoted keyframe can still be found by `get_frame`.
    frame_id_to_kfid: HashMap<Id, Id>,
    mappoints: HashMap<Id, MapPoint>,
}

impl MapInner {
    fn frame_mut(&mut self, id: Id) -> Option<&mut Frame> {
        if self.current_frame.id == id {
            return Some(&mut self.current_frame);
        }
        if let Some(&kfid) = self.frame_id_to_kfid.get(&id) {
            return self.keyframes.get_mut(&kfid);
        }
        self.keyframes.get_mut(&id)
    }

    fn frame(&self, id: Id) -> Option<&Frame> {
        if self.current_frame.id == id {
            return Some(&self.current_frame);
        }
        if let Some(&kfid) = self.frame_id_to_kfid.get(&id) {
            return self.keyframes.get(&kfid);
        }
        self.keyframes.get(&id)
    }
}

/// The shared, thread-safe custodian of every persistent entity
/// (`spec.md` §4.1). `map_lock` guards `inner`; `optimization_lock` is held
/// only across a local-map-matching merge batch, and — per the documented
/// lock order — must always be acquired *before* `inner` when both are
/// needed together.
pub struct Map {
    inner: Mutex<MapInner>,
    optimization_lock: Mutex<()>,
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl Map {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MapInner {
                next_frame_id: 1,
                next_kfid: 0,
                current_frame: Frame::new(0, None),
                keyframes: BTreeMap::new(),
                frame_id_to_kfid: HashMap::new(),
                mappoints: HashMap::new(),
            }),
            optimization_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MapInner> {
        self.inner.lock().expect("map lock poisoned")
    }

    /// Holds `optimization_lock` for the duration of `f`. Callers that also
    /// need `map_lock` must take it from inside `f` (never the reverse).
    pub fn with_optimization_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.optimization_lock.lock().expect("optimization lock poisoned");
        f()
    }

    /// Starts a new current frame for this tick, carrying forward the
    /// previous current frame's reference keyframe, pose and keypoint set
    /// (the Front-End's KLT step re-locates these same keypoints in the new
    /// image; only a keyframe promotion persists them under a new kfid).
    /// Returns the new id.
    pub fn begin_frame(&self) -> Id {
        let mut inner = self.lock();
        let id = inner.next_frame_id;
        inner.next_frame_id += 1;
        let kfid = inner.current_frame.kfid;
        let mut frame = Frame::new(id, kfid);
        frame.set_wc(inner.current_frame.wc);
        frame.keypoints = inner.current_frame.keypoints.clone();
        frame.recount();
        inner.current_frame = frame;
        id
    }

    pub fn current_frame_id(&self) -> Id {
        self.lock().current_frame.id
    }

    pub fn get_current_frame(&self) -> Frame {
        self.lock().current_frame.clone()
    }

    pub fn with_current_frame_mut<R>(&self, f: impl FnOnce(&mut Frame) -> R) -> R {
        let mut inner = self.lock();
        f(&mut inner.current_frame)
    }

    pub fn get_frame(&self, id: Id) -> Option<Frame> {
        self.lock().frame(id).cloned()
    }

    pub fn get_keyframe(&self, kfid: Id) -> Option<Frame> {
        self.lock().keyframes.get(&kfid).cloned()
    }

    pub fn get_mappoint(&self, kpid: Id) -> Option<MapPoint> {
        self.lock().mappoints.get(&kpid).cloned()
    }

    pub fn get_keypoint(&self, frame_or_kf_id: Id, kpid: Id) -> Option<Keypoint> {
        self.lock().frame(frame_or_kf_id)?.keypoints.get(&kpid).cloned()
    }

    /// Number of persisted keyframes.
    pub fn nb_keyframes(&self) -> usize {
        self.lock().keyframes.len()
    }

    pub fn oldest_covisible(&self, kfid: Id) -> Option<Id> {
        let inner = self.lock();
        let kf = inner.keyframes.get(&kfid)?;
        kf.covisibility.keys().min().copied()
    }

    /// Promotes the current frame to a keyframe, indexing it under a fresh
    /// sequence id. The caller (Front-End) is responsible for enqueuing the
    /// corresponding job with the Mapper; `Map` only owns entity bookkeeping.
    pub fn create_keyframe(&self) -> Id {
        let mut inner = self.lock();
        let kfid = inner.next_kfid;
        inner.next_kfid += 1;

        let mut kf = inner.current_frame.clone();
        kf.kfid = Some(kfid);
        let frame_id = kf.id;

        inner.frame_id_to_kfid.insert(frame_id, kfid);
        inner.keyframes.insert(kfid, kf);
        inner.current_frame.kfid = Some(kfid);
        kfid
    }

    /// Updates an observed pixel, recomputing its undistorted pixel and
    /// bearing through `camera`.
    pub fn update_keypoint<C: Camera>(
        &self,
        frame_id: Id,
        kpid: Id,
        new_pixel: Point2<f64>,
        camera: &C,
    ) -> Result<()> {
        let mut inner = self.lock();
        let Some(frame) = inner.frame_mut(frame_id) else {
            return Ok(());
        };
        let Some(kp) = frame.keypoints.get_mut(&kpid) else {
            return Ok(());
        };
        kp.pixel = new_pixel;
        kp.undistorted_pixel = camera.undistort_pixel(&new_pixel);
        kp.position = camera.unproject(&kp.undistorted_pixel);
        Ok(())
    }

    /// Sets a map point's world position and flips `is_3d`, propagating the
    /// flag to every observer keyframe's backing keypoint.
    pub fn update_mappoint(&self, kpid: Id, world_point: Vector3<f64>) -> Result<()> {
        let mut inner = self.lock();
        let Some(mp) = inner.mappoints.get_mut(&kpid) else {
            return Ok(());
        };
        mp.promote(world_point);
        let observers = mp.observers.clone();
        for kfid in observers {
            if let Some(kf) = inner.keyframes.get_mut(&kfid) {
                if let Some(kp) = kf.keypoints.get_mut(&kpid) {
                    kp.is_3d = true;
                }
                kf.recount();
            }
        }
        Ok(())
    }

    /// Removes one observer link from a map point; deletes the map point
    /// and its keypoint entry in `kfid` once the observer list is empty.
    pub fn remove_mappoint_obs(&self, kpid: Id, kfid: Id) -> Result<()> {
        let mut inner = self.lock();
        let emptied = match inner.mappoints.get_mut(&kpid) {
            Some(mp) => mp.remove_observer(kfid),
            None => return Ok(()),
        };
        if emptied {
            inner.mappoints.remove(&kpid);
            if let Some(kf) = inner.keyframes.get_mut(&kfid) {
                kf.remove_keypoint(kpid);
            }
        }
        Ok(())
    }

    /// Pairs a left keypoint with a matched right-image pixel (the Mapper's
    /// stereo-matching step, ahead of `spec.md` §4.4.1's triangulation).
    pub fn set_stereo_pixel(&self, frame_id: Id, kpid: Id, right_pixel: Point2<f64>) -> Result<()> {
        let mut inner = self.lock();
        let Some(frame) = inner.frame_mut(frame_id) else {
            return Ok(());
        };
        let Some(kp) = frame.keypoints.get_mut(&kpid) else {
            return Ok(());
        };
        kp.right_pixel = Some(right_pixel);
        frame.recount();
        Ok(())
    }

    pub fn remove_stereo_keypoint(&self, frame_id: Id, kpid: Id) -> Result<()> {
        let mut inner = self.lock();
        if let Some(frame) = inner.frame_mut(frame_id) {
            if let Some(kp) = frame.keypoints.get_mut(&kpid) {
                kp.right_pixel = None;
            }
            frame.recount();
        }
        Ok(())
    }

    /// Front-End-side helper invoked when optical flow fails on the current
    /// (not-yet-a-keyframe) frame: simply drops the local observation.
    pub fn remove_obs_from_current_frame(&self, kpid: Id) {
        let mut inner = self.lock();
        inner.current_frame.remove_keypoint(kpid);
    }

    /// Unions `prev_id`'s observations into `new_id`'s map point and retires
    /// `prev_id`. Idempotent when `prev_id == new_id`.
    pub fn merge_mappoints(&self, prev_id: Id, new_id: Id) -> Result<()> {
        if prev_id == new_id {
            return Ok(());
        }
        let mut inner = self.lock();
        let Some(prev) = inner.mappoints.remove(&prev_id) else {
            return Ok(());
        };
        let prev_observers = prev.observers.clone();
        let prev_world = prev.world;
        let prev_is_3d = prev.is_3d;
        let prev_descriptor = prev.descriptor.clone();

        for kfid in &prev_observers {
            if let Some(kf) = inner.keyframes.get_mut(kfid) {
                if let Some(mut kp) = kf.keypoints.remove(&prev_id) {
                    kp.id = new_id;
                    kf.keypoints.insert(new_id, kp);
                }
                kf.recount();
            }
        }

        let Some(surviving) = inner.mappoints.get_mut(&new_id) else {
            return Err(anyhow!("merge target map point {new_id} missing"));
        };
        for kfid in &prev_observers {
            surviving.add_observer(*kfid);
        }
        if surviving.descriptor.is_none() {
            surviving.descriptor = prev_descriptor;
        }
        let newly_promoted = !surviving.is_3d && prev_is_3d;
        if newly_promoted {
            surviving.promote(prev_world);
        }

        // Mirrors `update_mappoint`: a promotion must flip `is_3d` on every
        // observer's own keypoint record, not just the absorbed observers
        // above, since `new_id`'s pre-existing observers (including the
        // keyframe being merged into) never went through `update_mappoint`
        // for this promotion.
        if newly_promoted {
            let observers = inner.mappoints.get(&new_id).map(|mp| mp.observers.clone()).unwrap_or_default();
            for kfid in observers {
                if let Some(kf) = inner.keyframes.get_mut(&kfid) {
                    if let Some(kp) = kf.keypoints.get_mut(&new_id) {
                        kp.is_3d = true;
                    }
                    kf.recount();
                }
            }
        }
        Ok(())
    }

    /// Recomputes `kfid`'s covisibility map and `local_map_ids` by walking
    /// its 3D keypoints and accumulating the other observers of each backing
    /// map point. Pure function of current map state (`spec.md` §8).
    pub fn update_frame_covisibility(&self, kfid: Id) -> Result<()> {
        let mut inner = self.lock();
        let Some(kf) = inner.keyframes.get(&kfid) else {
            return Ok(());
        };
        let mut covis: HashMap<Id, usize> = HashMap::new();
        let mut local_map_ids = std::collections::HashSet::new();
        for kp in kf.keypoints.values().filter(|k| k.is_3d) {
            let Some(mp) = inner.mappoints.get(&kp.id) else {
                continue;
            };
            local_map_ids.insert(mp.id);
            for &observer in &mp.observers {
                if observer != kfid {
                    *covis.entry(observer).or_insert(0) += 1;
                }
            }
        }
        if let Some(kf) = inner.keyframes.get_mut(&kfid) {
            kf.covisibility = covis;
            kf.local_map_ids = local_map_ids;
        }
        Ok(())
    }

    /// Extends `kfid`'s `local_map_ids` with the local map of `other_kfid`.
    pub fn union_local_map(&self, kfid: Id, other_kfid: Id) {
        let mut inner = self.lock();
        let Some(other_ids) = inner.keyframes.get(&other_kfid).map(|kf| kf.local_map_ids.clone())
        else {
            return;
        };
        if let Some(kf) = inner.keyframes.get_mut(&kfid) {
            kf.local_map_ids.extend(other_ids);
        }
    }

    /// Creates a fresh 2D map point for a freshly extracted keypoint and
    /// inserts both into `kfid`'s keypoint set. Used by feature extraction
    /// when seeding a new keyframe with candidate landmarks.
    pub fn insert_2d_keypoint(&self, kfid: Id, kp: Keypoint) {
        let mut inner = self.lock();
        let id = kp.id;
        let mut mp = MapPoint::new_2d(id, kfid);
        mp.descriptor = kp.descriptor.clone();
        inner.mappoints.insert(id, mp);
        if let Some(kf) = inner.frame_mut(kfid) {
            kf.insert_keypoint(kp);
        }
    }

    /// Registers `kfid` as an additional observer of an existing map point,
    /// inserting `kp`'s own record into `kfid`'s keypoint set. Used when a
    /// keyframe is promoted while re-tracking a keypoint that already backs
    /// a map point from an earlier keyframe — unlike `insert_2d_keypoint`,
    /// this never mints a new map point.
    pub fn add_keypoint_observation(&self, kfid: Id, kp: Keypoint) {
        let mut inner = self.lock();
        let id = kp.id;
        if let Some(mp) = inner.mappoints.get_mut(&id) {
            mp.add_observer(kfid);
        }
        if let Some(kf) = inner.frame_mut(kfid) {
            kf.insert_keypoint(kp);
        }
    }

    pub fn world_point_of(&self, kpid: Id) -> Option<Vector3<f64>> {
        self.lock().mappoints.get(&kpid).filter(|m| m.is_3d).map(|m| m.world)
    }

    /// Projects `world` through `camera` and `frame`'s pose; a thin
    /// convenience used by local-map matching and by tests.
    pub fn project<C: Camera>(&self, camera: &C, frame_id: Id, world: &Vector3<f64>) -> Option<Point2<f64>> {
        let frame = self.get_frame(frame_id)?;
        let cam4 = crate::geometry::project_world_to_camera(&frame, &to_homogeneous(world));
        camera.project(&from_homogeneous(&cam4))
    }

    pub fn candidate_mappoints(&self, kfid: Id) -> Vec<Id> {
        self.lock()
            .keyframes
            .get(&kfid)
            .map(|kf| kf.local_map_ids.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_mappoints_is_idempotent_for_equal_ids() {
        let map = Map::new();
        map.begin_frame();
        let kfid = map.create_keyframe();
        map.insert_2d_keypoint(kfid, Keypoint::new(1, Point2::new(0.0, 0.0), Point2::new(0.0, 0.0), Vector3::new(0.0, 0.0, 1.0)));
        map.merge_mappoints(1, 1).unwrap();
        assert!(map.get_mappoint(1).is_some());
    }

    #[test]
    fn remove_mappoint_obs_deletes_when_last_observer_leaves() {
        let map = Map::new();
        map.begin_frame();
        let kfid = map.create_keyframe();
        map.insert_2d_keypoint(kfid, Keypoint::new(5, Point2::new(1.0, 1.0), Point2::new(1.0, 1.0), Vector3::new(0.0, 0.0, 1.0)));
        assert!(map.get_mappoint(5).is_some());
        map.remove_mappoint_obs(5, kfid).unwrap();
        assert!(map.get_mappoint(5).is_none());
        assert!(map.get_keypoint(kfid, 5).is_none());
    }
}
