pub mod pinhole_camera;

/// A source of synchronized left/right image pairs, consumed by the
/// stereo front-end.
pub trait HasStereoCamera {
    type FrameItem;

    fn get_stereo_frame(self) -> Option<(Self::FrameItem, Self::FrameItem)>;
}

#[cfg(test)]
mod tests {
    use std::io::BufRead;

    #[test]
    fn test_pinhole_camera() {
        let calib_file_path = std::path::Path::new("../datasets/01/calib.txt");

        let Ok(file) = std::fs::File::open(calib_file_path) else {
            return;
        };
        let file = std::io::BufReader::new(file);

        let lines = file.lines().filter_map(|l| l.ok());
        println!("test pinhole camera");
        for l in lines {
            println!("{l:?}");
        }
    }
}
