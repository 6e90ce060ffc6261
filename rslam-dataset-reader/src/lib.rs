pub mod kitti_reader;
