pub mod errors;
pub mod hls;

pub use hls::{MasterPlaylist, MediaPlaylist, Playlist, parse_playlist};
