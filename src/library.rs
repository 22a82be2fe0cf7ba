//! Music folder index and fuzzy song lookup.

use deunicode::deunicode;
use std::fs;
use std::path::{Path, PathBuf};

pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "ogg", "flac", "aac"];

/// Best score must exceed this for a song to be picked.
pub const MATCH_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Song {
    /// File name without extension, used for matching.
    pub name: String,
    pub file_name: String,
    pub path: PathBuf,
}

/// Immutable list of songs found under the music folder.
#[derive(Debug, Clone, Default)]
pub struct SongIndex {
    songs: Vec<Song>,
}

impl SongIndex {
    pub fn from_songs(songs: Vec<Song>) -> Self {
        Self { songs }
    }

    /// Recursively index audio files under `dir`. A missing folder gives an
    /// empty index.
    pub fn scan(dir: &Path) -> Self {
        let mut songs = Vec::new();
        if !dir.is_dir() {
            tracing::warn!(folder = %dir.display(), "music folder not found, create it and add songs");
            return Self { songs };
        }
        walk(dir, &mut songs);
        Self { songs }
    }

    pub fn songs(&self) -> &[Song] {
        &self.songs
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    pub fn first(&self) -> Option<&Song> {
        self.songs.first()
    }

    /// Best matching song for `query`, or `None` if nothing scores above
    /// [`MATCH_THRESHOLD`].
    pub fn find(&self, query: &str) -> Option<&Song> {
        let query = normalize(query);
        if query.is_empty() {
            return None;
        }
        let mut best: Option<(&Song, f64)> = None;
        for song in &self.songs {
            let score = match_score(&query, &normalize(&song.name));
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((song, score));
            }
        }
        best.filter(|(_, score)| *score > MATCH_THRESHOLD)
            .map(|(song, _)| song)
    }

    pub fn log_summary(&self, dir: &Path) {
        tracing::info!(count = self.songs.len(), folder = %dir.display(), "indexed songs");
        for song in self.songs.iter().take(10) {
            tracing::info!("  - {}", song.name);
        }
        if self.songs.len() > 10 {
            tracing::info!("  ... and {} more", self.songs.len() - 10);
        }
    }
}

fn walk(dir: &Path, songs: &mut Vec<Song>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(folder = %dir.display(), error = %e, "cannot read music folder");
            return;
        }
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        if path.is_dir() {
            walk(&path, songs);
        } else if is_audio(&path) {
            let (Some(stem), Some(file_name)) = (path.file_stem(), path.file_name()) else {
                continue;
            };
            songs.push(Song {
                name: stem.to_string_lossy().into_owned(),
                file_name: file_name.to_string_lossy().into_owned(),
                path: path.clone(),
            });
        }
    }
}

fn is_audio(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.as_str()))
}

/// Names and queries are compared in ASCII transliteration, so scores count
/// transliterated characters ("ß" is two).
fn normalize(text: &str) -> String {
    deunicode(text).to_lowercase().trim().to_string()
}

/// Substring hits score `len(query)/len(name) + 0.5`, anything else falls
/// back to the similarity ratio.
pub fn match_score(query: &str, name: &str) -> f64 {
    if !name.is_empty() && name.contains(query) {
        query.chars().count() as f64 / name.chars().count() as f64 + 0.5
    } else {
        similarity(query, name)
    }
}

/// Ratcliff/Obershelp similarity: `2 * matches / (len(a) + len(b))`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (i, j, len) = longest_common_block(a, b);
    if len == 0 {
        return 0;
    }
    len + matching_chars(&a[..i], &b[..j]) + matching_chars(&a[i + len..], &b[j + len..])
}

/// Longest common contiguous block, earliest in `a` then `b` on ties.
fn longest_common_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    for i in 0..a.len() {
        let mut row = vec![0usize; b.len() + 1];
        for j in 0..b.len() {
            if a[i] == b[j] {
                row[j + 1] = prev[j] + 1;
                let len = row[j + 1];
                if len > best.2 {
                    best = (i + 1 - len, j + 1 - len, len);
                }
            }
        }
        prev = row;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn song(name: &str) -> Song {
        Song {
            name: name.to_string(),
            file_name: format!("{}.mp3", name),
            path: PathBuf::from(format!("/music/{}.mp3", name)),
        }
    }

    #[test]
    fn test_similarity_ratio() {
        assert_eq!(similarity("abcd", "abcd"), 1.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
        // "abcd" vs "bcde": common block "bcd"
        assert!((similarity("abcd", "bcde") - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_substring_scores_above_fuzzy() {
        assert!((match_score("jazz", "jazz") - 1.5).abs() < 1e-9);
        assert!((match_score("jazz", "smooth jazz") - (4.0 / 11.0 + 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_exact_name_beats_fuzzy_match() {
        let index = SongIndex::from_songs(vec![song("Yellow Submarines"), song("Yellow")]);
        assert_eq!(index.find("YELLOW").unwrap().name, "Yellow");
    }

    #[test]
    fn test_exact_name_beats_other_fuzzy_candidate() {
        let index = SongIndex::from_songs(vec![song("Hey Jude"), song("Hey Judy")]);
        assert_eq!(index.find("hey judy").unwrap().name, "Hey Judy");
    }

    #[test]
    fn test_unrelated_query_has_no_match() {
        let index = SongIndex::from_songs(vec![song("aaaa"), song("bbbb")]);
        assert!(index.find("xyz").is_none());
        assert!(index.find("").is_none());
    }

    #[test]
    fn test_accents_are_ignored() {
        let index = SongIndex::from_songs(vec![song("Beyoncé - Halo")]);
        assert_eq!(index.find("beyonce").unwrap().name, "Beyoncé - Halo");
    }

    #[test]
    fn test_transliterated_names_match() {
        let index = SongIndex::from_songs(vec![song("Straße"), song("Strata")]);
        assert_eq!(index.find("strasse").unwrap().name, "Straße");
        // Scored as a full substring hit against "strasse"
        assert_eq!(match_score(&normalize("strasse"), &normalize("Straße")), 1.5);
    }

    #[test]
    fn test_scan_is_recursive_and_filters_extensions() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("albums").join("blue");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join("Intro.MP3"), b"x").unwrap();
        fs::write(nested.join("Kind of Blue.flac"), b"x").unwrap();
        fs::write(nested.join("cover.jpg"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let index = SongIndex::scan(dir.path());
        let names: Vec<&str> = index.songs().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Intro", "Kind of Blue"]);
        assert_eq!(index.songs()[1].file_name, "Kind of Blue.flac");
        assert!(index.songs()[1].path.ends_with("albums/blue/Kind of Blue.flac"));
    }

    #[test]
    fn test_scan_missing_folder_is_empty() {
        let dir = tempdir().unwrap();
        let index = SongIndex::scan(&dir.path().join("nope"));
        assert!(index.is_empty());
    }
}
