//! Local and remote media track bookkeeping.
//!
//! Capture is outside this crate: a [`LocalTrack`] only names a track and its
//! kind. Transports map it onto their own track objects.

use crate::utils::random_id;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Whether this kind is picked by a `(video, audio)` selector
    pub fn selected(self, video: bool, audio: bool) -> bool {
        match self {
            MediaKind::Video => video,
            MediaKind::Audio => audio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
    pub enabled: bool,
}

impl LocalTrack {
    pub fn new(kind: MediaKind) -> Self {
        Self::with_id(random_id(), kind)
    }

    pub fn with_id(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: true,
        }
    }

    pub fn audio() -> Self {
        Self::new(MediaKind::Audio)
    }

    pub fn video() -> Self {
        Self::new(MediaKind::Video)
    }
}

/// Track announced by the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

/// The set of tracks this side sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl Default for LocalStream {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStream {
    pub fn new() -> Self {
        Self {
            id: random_id(),
            tracks: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, track_id: &str) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.id == track_id)
    }

    /// Returns false if a track with the same id is already present
    pub fn add(&mut self, track: LocalTrack) -> bool {
        if self.get(&track.id).is_some() {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn remove(&mut self, track_id: &str) -> Option<LocalTrack> {
        let idx = self.tracks.iter().position(|t| t.id == track_id)?;
        Some(self.tracks.remove(idx))
    }

    /// Remove every track whose kind is selected
    pub fn remove_kinds(&mut self, video: bool, audio: bool) -> Vec<LocalTrack> {
        let (removed, kept) = self
            .tracks
            .drain(..)
            .partition(|t| t.kind.selected(video, audio));
        self.tracks = kept;
        removed
    }

    /// Swap `old_id` for `track` in place
    pub fn replace(&mut self, old_id: &str, track: LocalTrack) -> bool {
        match self.tracks.iter_mut().find(|t| t.id == old_id) {
            Some(slot) => {
                *slot = track;
                true
            }
            None => false,
        }
    }

    /// Set `enabled` on selected tracks, returning the ids that changed
    pub fn set_enabled(&mut self, video: bool, audio: bool, enabled: bool) -> Vec<String> {
        self.tracks
            .iter_mut()
            .filter(|t| t.kind.selected(video, audio) && t.enabled != enabled)
            .map(|t| {
                t.enabled = enabled;
                t.id.clone()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn av_stream() -> LocalStream {
        let mut stream = LocalStream::new();
        stream.add(LocalTrack::with_id("v1", MediaKind::Video));
        stream.add(LocalTrack::with_id("a1", MediaKind::Audio));
        stream
    }

    #[test]
    fn duplicate_tracks_are_rejected() {
        let mut stream = av_stream();
        assert!(!stream.add(LocalTrack::with_id("v1", MediaKind::Video)));
        assert_eq!(stream.len(), 2);
    }

    #[test]
    fn remove_kinds_keeps_unselected() {
        let mut stream = av_stream();
        let removed = stream.remove_kinds(true, false);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "v1");
        assert_eq!(stream.tracks().len(), 1);
        assert_eq!(stream.tracks()[0].kind, MediaKind::Audio);
    }

    #[test]
    fn set_enabled_reports_only_changes() {
        let mut stream = av_stream();
        assert_eq!(stream.set_enabled(false, true, false), vec!["a1".to_string()]);
        assert!(stream.set_enabled(false, true, false).is_empty());
        assert!(!stream.get("a1").unwrap().enabled);
        assert!(stream.get("v1").unwrap().enabled);
    }

    #[test]
    fn replace_swaps_in_place() {
        let mut stream = av_stream();
        assert!(stream.replace("v1", LocalTrack::with_id("v2", MediaKind::Video)));
        assert_eq!(stream.tracks()[0].id, "v2");
        assert!(!stream.replace("missing", LocalTrack::video()));
    }
}
