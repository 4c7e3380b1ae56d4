/// Near-bottom distance used to resume follow mode deterministically.
pub const AUTO_FOLLOW_RESUME_THRESHOLD: f32 = 24.0;
/// Distance from the top at which older history should be requested.
pub const LOAD_MORE_THRESHOLD: f32 = 24.0;
/// Small delta used to ignore floating-point scroll jitter.
const SCROLL_DELTA_EPSILON: f32 = 1.0;

/// Scroll metrics reported by the rendering layer.
///
/// `offset` grows downwards from 0 (top) to `max_offset` (tail).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportMetrics {
    pub offset: f32,
    pub max_offset: f32,
}

/// Tracks follow-bottom mode, unread turns and scroll anchoring, independent of content.
#[derive(Debug, Clone, PartialEq)]
pub struct Viewport {
    pending_scroll_to_bottom: bool,
    follow_bottom: bool,
    current: ViewportMetrics,
    last: ViewportMetrics,
    unread: usize,
}

impl Viewport {
    pub fn new() -> Self {
        Self {
            pending_scroll_to_bottom: false,
            follow_bottom: true,
            current: ViewportMetrics::default(),
            last: ViewportMetrics::default(),
            unread: 0,
        }
    }

    pub fn is_following_bottom(&self) -> bool {
        self.follow_bottom
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    pub fn metrics(&self) -> ViewportMetrics {
        self.current
    }

    /// Explicit jump to the tail, e.g. after the user sends or presses the scroll button.
    pub fn request_scroll_to_bottom(&mut self) {
        self.pending_scroll_to_bottom = true;
        self.follow_bottom = true;
    }

    pub fn reset(&mut self) {
        self.current = ViewportMetrics::default();
        self.last = ViewportMetrics::default();
        self.follow_bottom = true;
        self.pending_scroll_to_bottom = true;
        self.unread = 0;
    }

    /// Records newly appended turns and reports whether the view should autoscroll.
    pub fn note_appended(&mut self, count: usize) -> bool {
        if self.follow_bottom || self.pending_scroll_to_bottom || self.was_near_bottom() {
            self.pending_scroll_to_bottom = true;
            true
        } else {
            self.unread += count;
            false
        }
    }

    pub fn update_follow_state(&mut self, metrics: ViewportMetrics) {
        self.current = metrics;

        let offset_delta = metrics.offset - self.last.offset;
        let max_delta = (metrics.max_offset - self.last.max_offset).abs();
        let content_size_changed = max_delta > SCROLL_DELTA_EPSILON;
        let user_scrolled_up = offset_delta < -SCROLL_DELTA_EPSILON && !content_size_changed;
        let user_scrolled_down = offset_delta > SCROLL_DELTA_EPSILON && !content_size_changed;

        // Keep follow mode enabled while an explicit follow request is being fulfilled.
        if self.pending_scroll_to_bottom || (content_size_changed && self.was_near_bottom()) {
            self.follow_bottom = true;
        } else if self.follow_bottom {
            if user_scrolled_up {
                self.follow_bottom = false;
            }
        } else if user_scrolled_down && self.is_near_bottom() {
            self.follow_bottom = true;
        }

        if self.follow_bottom && self.is_near_bottom() {
            self.unread = 0;
        }
        self.last = metrics;
    }

    /// Returns the offset to scroll to when follow mode or a pending request calls for it.
    pub fn apply_pending_scroll(&mut self) -> Option<f32> {
        let should_scroll = self.follow_bottom || self.pending_scroll_to_bottom;
        self.pending_scroll_to_bottom = false;

        if !should_scroll {
            return None;
        }

        let target = self.current.max_offset.max(0.0);
        self.current.offset = target;
        self.last = self.current;
        self.unread = 0;
        Some(target)
    }

    /// Keeps the same turn under the user's eyes after older turns grew the content by
    /// `height_delta`. Returns the compensated offset.
    pub fn compensate_prepend(&mut self, height_delta: f32) -> f32 {
        let height_delta = height_delta.max(0.0);
        self.current.offset += height_delta;
        self.current.max_offset += height_delta;
        // Not a user scroll.
        self.last = self.current;
        self.current.offset
    }

    /// True when the user has reached the top and older history should be requested.
    pub fn wants_older_history(&self) -> bool {
        self.current.max_offset > 0.0 && self.current.offset <= LOAD_MORE_THRESHOLD
    }

    fn is_near_bottom(&self) -> bool {
        Self::near_bottom(self.current)
    }

    fn was_near_bottom(&self) -> bool {
        Self::near_bottom(self.last)
    }

    fn near_bottom(metrics: ViewportMetrics) -> bool {
        if metrics.max_offset <= 0.0 {
            return true;
        }
        (metrics.max_offset - metrics.offset).abs() <= AUTO_FOLLOW_RESUME_THRESHOLD
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new()
    }
}
