//! Classification and routing of inbound tracks into a stable per-peer
//! remote stream.

use crate::engine::{RemoteTrack, TrackKind};

/// Label substrings that mark a video track as display capture.
const SCREEN_LABEL_HINTS: [&str; 4] = ["screen", "window", "tab", "display"];

/// Resolution above which an unlabeled video track is assumed to be a
/// screen-share. Cameras rarely exceed this; captured desktops almost
/// always do.
const SCREEN_MIN_WIDTH: u32 = 1000;
const SCREEN_MIN_HEIGHT: u32 = 700;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackClass {
    Camera,
    ScreenShare,
}

/// Slot an inbound track landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSlot {
    Audio,
    Camera,
    ScreenShare,
}

/// Classify an inbound video track. Checked in priority order: label hints,
/// then the capture-surface setting, then resolution.
pub fn classify_video(track: &RemoteTrack) -> TrackClass {
    let label = track.label.to_lowercase();
    if SCREEN_LABEL_HINTS.iter().any(|hint| label.contains(hint)) {
        return TrackClass::ScreenShare;
    }
    if track.display_surface.is_some() {
        return TrackClass::ScreenShare;
    }
    if track.width > SCREEN_MIN_WIDTH && track.height > SCREEN_MIN_HEIGHT {
        return TrackClass::ScreenShare;
    }
    TrackClass::Camera
}

/// The remote stream for one peer: at most one audio, one camera, and one
/// screen-share track. Replacement never crosses slots, so a fresh camera
/// track cannot displace a running screen-share.
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    audio: Option<RemoteTrack>,
    camera: Option<RemoteTrack>,
    screen: Option<RemoteTrack>,
}

impl RemoteStream {
    /// Route an inbound track into its slot. Tracks are always enabled on
    /// arrival, whatever the sender last toggled.
    pub fn route(&mut self, mut track: RemoteTrack) -> TrackSlot {
        track.enabled = true;
        match track.kind {
            TrackKind::Audio => {
                self.audio = Some(track);
                TrackSlot::Audio
            }
            TrackKind::Video => match classify_video(&track) {
                TrackClass::Camera => {
                    self.camera = Some(track);
                    TrackSlot::Camera
                }
                TrackClass::ScreenShare => {
                    self.screen = Some(track);
                    TrackSlot::ScreenShare
                }
            },
        }
    }

    pub fn audio(&self) -> Option<&RemoteTrack> {
        self.audio.as_ref()
    }

    pub fn camera(&self) -> Option<&RemoteTrack> {
        self.camera.as_ref()
    }

    pub fn screen_share(&self) -> Option<&RemoteTrack> {
        self.screen.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &RemoteTrack> {
        self.audio
            .iter()
            .chain(self.camera.iter())
            .chain(self.screen.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.camera.is_none() && self.screen.is_none()
    }
}
