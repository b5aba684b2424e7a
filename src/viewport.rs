//! On-screen keyboard detection for mobile layouts.
//!
//! The tracker derives a [`KeyboardInsetState`] from visual-viewport
//! geometry, focus changes and two media queries, and publishes it on a
//! `watch` channel. It never touches a real window: a [`ViewportHost`]
//! answers geometry/focus/media queries and owns the listener registrations,
//! and the embedder forwards host events to [`InsetTracker::handle`].

use crate::config::ViewportConfig;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Snapshot of the keyboard and layout state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyboardInsetState {
    /// Pixels of layout viewport hidden below the visual viewport
    pub offset_px: u32,
    pub is_open: bool,
    /// A tracked input currently has focus
    pub input_focused: bool,
    pub is_mobile_viewport: bool,
}

impl KeyboardInsetState {
    pub fn should_hide_bottom_nav(&self) -> bool {
        self.is_mobile_viewport && (self.is_open || self.input_focused)
    }
}

/// Layout and visual viewport measurements, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportGeometry {
    pub inner_height: f64,
    pub visual_height: f64,
    pub visual_offset_top: f64,
}

impl ViewportGeometry {
    pub fn inset_px(&self) -> u32 {
        let raw = (self.inner_height - self.visual_height - self.visual_offset_top).round();
        if raw.is_finite() && raw > 0.0 {
            raw.min(u32::MAX as f64) as u32
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaQuery {
    /// `(max-width: Npx)`
    MaxWidth(u32),
    /// `(pointer: coarse)`
    CoarsePointer,
}

impl fmt::Display for MediaQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaQuery::MaxWidth(px) => write!(f, "(max-width: {px}px)"),
            MediaQuery::CoarsePointer => f.write_str("(pointer: coarse)"),
        }
    }
}

/// Host event sources the tracker subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Listener {
    VisualViewportResize,
    VisualViewportScroll,
    WindowResize,
    Media(MediaQuery),
    FocusIn,
    FocusOut,
}

/// Events the embedder forwards from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportEvent {
    VisualViewportResize,
    VisualViewportScroll,
    WindowResize,
    MediaChange(MediaQuery),
    /// Focus entered an element; `tracked` if it is one of ours
    FocusIn { tracked: bool },
    FocusOut,
    /// The frame requested after a focus-out is being rendered
    AnimationFrame,
}

/// What the tracker needs from the embedding window.
pub trait ViewportHost: Send + Sync {
    /// Current geometry, or `None` when there is no visual viewport.
    fn geometry(&self) -> Option<ViewportGeometry>;
    /// Whether the active element is (inside) a tracked input.
    fn active_element_tracked(&self) -> bool;
    fn media_matches(&self, query: MediaQuery) -> bool;
    fn listen(&self, listener: Listener);
    fn unlisten(&self, listener: Listener);
    /// Deliver [`ViewportEvent::AnimationFrame`] before the next paint.
    fn request_animation_frame(&self);
}

/// Listener registrations held by a mounted tracker. Dropping it removes
/// every one of them from the host.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    host: Arc<dyn ViewportHost>,
    listeners: Vec<Listener>,
}

impl Subscription {
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for listener in self.listeners.drain(..) {
            self.host.unlisten(listener);
        }
        trace!("viewport listeners removed");
    }
}

pub struct InsetTracker {
    host: Arc<dyn ViewportHost>,
    threshold_px: u32,
    narrow: MediaQuery,
    state: KeyboardInsetState,
    focus_check_pending: bool,
    tx: watch::Sender<KeyboardInsetState>,
}

impl fmt::Debug for InsetTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsetTracker")
            .field("threshold_px", &self.threshold_px)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl InsetTracker {
    /// Subscribe to `host` and compute the initial state.
    ///
    /// Visual-viewport listeners are only registered when the host has a
    /// visual viewport at mount time.
    pub fn mount(host: Arc<dyn ViewportHost>, config: &ViewportConfig) -> (Self, Subscription) {
        let narrow = MediaQuery::MaxWidth(config.mobile_max_width_px);

        let mut listeners = Vec::with_capacity(7);
        if host.geometry().is_some() {
            listeners.push(Listener::VisualViewportResize);
            listeners.push(Listener::VisualViewportScroll);
        }
        listeners.extend([
            Listener::WindowResize,
            Listener::Media(narrow),
            Listener::Media(MediaQuery::CoarsePointer),
            Listener::FocusIn,
            Listener::FocusOut,
        ]);
        for listener in &listeners {
            host.listen(*listener);
        }

        let (tx, _) = watch::channel(KeyboardInsetState::default());
        let mut tracker = Self {
            host: host.clone(),
            threshold_px: config.keyboard_threshold_px,
            narrow,
            state: KeyboardInsetState::default(),
            focus_check_pending: false,
            tx,
        };
        tracker.state.input_focused = host.active_element_tracked();
        tracker.refresh_geometry();
        tracker.refresh_media();
        tracker.publish();
        debug!(listeners = listeners.len(), state = ?tracker.state, "viewport tracker mounted");

        (tracker, Subscription { host, listeners })
    }

    pub fn state(&self) -> KeyboardInsetState {
        self.state
    }

    /// Receiver that sees every state change.
    pub fn subscribe(&self) -> watch::Receiver<KeyboardInsetState> {
        self.tx.subscribe()
    }

    /// Apply one host event and return the resulting state.
    pub fn handle(&mut self, event: ViewportEvent) -> KeyboardInsetState {
        match event {
            ViewportEvent::VisualViewportResize
            | ViewportEvent::VisualViewportScroll
            | ViewportEvent::WindowResize => self.refresh_geometry(),
            ViewportEvent::MediaChange(_) => self.refresh_media(),
            ViewportEvent::FocusIn { tracked } => {
                if tracked {
                    self.state.input_focused = true;
                }
            }
            ViewportEvent::FocusOut => {
                // Focus may be moving to another tracked input; decide once
                // the new active element is settled.
                if !self.focus_check_pending {
                    self.focus_check_pending = true;
                    self.host.request_animation_frame();
                }
            }
            ViewportEvent::AnimationFrame => {
                if self.focus_check_pending {
                    self.focus_check_pending = false;
                    self.state.input_focused = self.host.active_element_tracked();
                }
            }
        }
        self.publish();
        self.state
    }

    fn refresh_geometry(&mut self) {
        let offset = self.host.geometry().map_or(0, |g| g.inset_px());
        self.state.offset_px = offset;
        self.state.is_open = offset > self.threshold_px;
    }

    fn refresh_media(&mut self) {
        self.state.is_mobile_viewport = self.host.media_matches(self.narrow)
            && self.host.media_matches(MediaQuery::CoarsePointer);
    }

    fn publish(&self) {
        let next = self.state;
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            trace!(state = ?next, "keyboard inset changed");
        }
    }
}
