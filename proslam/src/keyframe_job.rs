use opencv::core::Mat;
use rslam_core::Id;

/// A message posted to the Mapper queue when the Front-End promotes a
/// keyframe (`spec.md` §3). Carries everything the Mapper needs to run its
/// stereo/temporal triangulation passes without touching the Front-End's
/// own double-buffered images.
pub struct KeyFrameJob {
    pub kfid: Id,
    pub image_left: Option<Mat>,
    pub image_right: Option<Mat>,
}

impl KeyFrameJob {
    pub fn with_images(kfid: Id, image_left: Mat, image_right: Option<Mat>) -> Self {
        Self { kfid, image_left: Some(image_left), image_right }
    }
}
