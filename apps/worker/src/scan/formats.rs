//! Audio file recognition

use std::path::Path;

/// Supported audio file extensions
/// Includes common lossy and lossless formats
pub const AUDIO_EXTENSIONS: &[&str] = &[
    // Lossy formats
    "mp3", "ogg", "opus", "aac", "m4a", "wma", "mpc", "ape", // Lossless formats
    "flac", "wav", "aiff", "aif", "alac", "dsf", "dff", "wv", // Container formats
    "m4b", "m4p", "m4r", "mp4", "3gp", "webm",
];

/// Lower-cased extension of `path` if it is a supported audio format
pub fn audio_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    AUDIO_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Check if a file path has a supported audio extension
pub fn is_audio_file(path: &Path) -> bool {
    audio_extension(path).is_some()
}

/// Normalize a user-supplied extension: lower-case, no leading dot
pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_audio_file() {
        assert!(is_audio_file(Path::new("/music/song.mp3")));
        assert!(is_audio_file(Path::new("/music/song.FLAC")));
        assert!(is_audio_file(Path::new("/music/song.m4a")));
        assert!(!is_audio_file(Path::new("/music/image.jpg")));
        assert!(!is_audio_file(Path::new("/music/folder")));
        assert!(!is_audio_file(Path::new("/music/.mp3")));
    }

    #[test]
    fn test_audio_extension_is_lowercased() {
        assert_eq!(
            audio_extension(Path::new("/music/Track.OPUS")),
            Some("opus".to_string())
        );
        assert_eq!(audio_extension(Path::new("/music/notes.txt")), None);
    }

    #[test]
    fn test_normalize_extension() {
        assert_eq!(normalize_extension(".WAV"), "wav");
        assert_eq!(normalize_extension(" flac "), "flac");
    }
}
