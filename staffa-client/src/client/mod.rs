pub mod view_v1;
