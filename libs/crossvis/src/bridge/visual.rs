// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Visual tree bound as a shared resource's root.
//!
//! Children are stored bottom to top. Layout walks the tree in painter's
//! order, so the returned sprites can be drawn front to back as listed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const MEDIUM_PURPLE: Color = Color::rgb(147, 112, 219);
    pub const WHITE: Color = Color::rgb(255, 255, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VisualKind {
    /// Groups children, draws nothing itself.
    Container,
    /// Solid colour fill.
    Sprite { color: Color },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VisualSize {
    /// Pixels.
    Absolute { width: f32, height: f32 },
    /// Fraction of the parent's size.
    Relative { width: f32, height: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    /// Normalized time in `[0, 1]`.
    pub progress: f32,
    /// Relative offset at that time.
    pub offset: [f32; 2],
}

/// Animates a visual's relative offset between keyframes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyframeAnimation {
    pub keyframes: Vec<Keyframe>,
    pub duration_ms: u64,
    /// Loop forever instead of holding the last keyframe.
    pub repeat: bool,
}

impl KeyframeAnimation {
    pub fn new(duration: Duration, repeat: bool) -> Self {
        Self {
            keyframes: Vec::new(),
            duration_ms: duration.as_millis() as u64,
            repeat,
        }
    }

    /// Add a keyframe; keyframes are kept sorted by progress.
    pub fn with_keyframe(mut self, progress: f32, offset: [f32; 2]) -> Self {
        let progress = progress.clamp(0.0, 1.0);
        let at = self
            .keyframes
            .partition_point(|k| k.progress <= progress);
        self.keyframes.insert(at, Keyframe { progress, offset });
        self
    }

    /// Offset at `elapsed`, linearly interpolated. `None` without keyframes.
    pub fn sample(&self, elapsed: Duration) -> Option<[f32; 2]> {
        let first = self.keyframes.first()?;
        if self.duration_ms == 0 {
            return self.keyframes.last().map(|k| k.offset);
        }

        let elapsed_ms = elapsed.as_millis() as u64;
        let local_ms = if self.repeat {
            elapsed_ms % self.duration_ms
        } else {
            elapsed_ms.min(self.duration_ms)
        };
        let progress = local_ms as f32 / self.duration_ms as f32;

        if progress <= first.progress {
            return Some(first.offset);
        }
        for pair in self.keyframes.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if progress <= b.progress {
                let span = b.progress - a.progress;
                let t = if span > 0.0 {
                    (progress - a.progress) / span
                } else {
                    1.0
                };
                return Some([
                    a.offset[0] + (b.offset[0] - a.offset[0]) * t,
                    a.offset[1] + (b.offset[1] - a.offset[1]) * t,
                ]);
            }
        }
        self.keyframes.last().map(|k| k.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn from_size(width: f32, height: f32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// A sprite resolved to a rectangle in target coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacedSprite {
    pub rect: Rect,
    pub color: Color,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visual {
    pub kind: VisualKind,
    pub size: VisualSize,
    /// Position of the anchor point, as a fraction of the parent's size.
    pub relative_offset: [f32; 2],
    /// Point of this visual placed at the offset, as a fraction of its own size.
    pub anchor: [f32; 2],
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Visual>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation: Option<KeyframeAnimation>,
}

impl Visual {
    fn with_kind(kind: VisualKind) -> Self {
        Self {
            kind,
            size: VisualSize::Relative {
                width: 1.0,
                height: 1.0,
            },
            relative_offset: [0.0, 0.0],
            anchor: [0.0, 0.0],
            children: Vec::new(),
            animation: None,
        }
    }

    /// A container filling its parent.
    pub fn container() -> Self {
        Self::with_kind(VisualKind::Container)
    }

    /// A solid sprite filling its parent.
    pub fn sprite(color: Color) -> Self {
        Self::with_kind(VisualKind::Sprite { color })
    }

    pub fn with_size(mut self, width: f32, height: f32) -> Self {
        self.size = VisualSize::Absolute { width, height };
        self
    }

    pub fn with_relative_size(mut self, width: f32, height: f32) -> Self {
        self.size = VisualSize::Relative { width, height };
        self
    }

    pub fn with_relative_offset(mut self, x: f32, y: f32) -> Self {
        self.relative_offset = [x, y];
        self
    }

    pub fn with_anchor(mut self, x: f32, y: f32) -> Self {
        self.anchor = [x, y];
        self
    }

    pub fn with_animation(mut self, animation: KeyframeAnimation) -> Self {
        self.animation = Some(animation);
        self
    }

    /// Insert above all existing children.
    pub fn with_child_on_top(mut self, child: Visual) -> Self {
        self.children.push(child);
        self
    }

    /// Insert below all existing children.
    pub fn with_child_at_bottom(mut self, child: Visual) -> Self {
        self.children.insert(0, child);
        self
    }

    /// Resolve this tree against `parent` at time `elapsed`.
    pub fn layout(&self, parent: Rect, elapsed: Duration) -> Vec<PlacedSprite> {
        let mut out = Vec::new();
        self.layout_into(parent, elapsed, &mut out);
        out
    }

    fn layout_into(&self, parent: Rect, elapsed: Duration, out: &mut Vec<PlacedSprite>) {
        let (width, height) = match self.size {
            VisualSize::Absolute { width, height } => (width, height),
            VisualSize::Relative { width, height } => (parent.width * width, parent.height * height),
        };
        let offset = self
            .animation
            .as_ref()
            .and_then(|a| a.sample(elapsed))
            .unwrap_or(self.relative_offset);

        let rect = Rect {
            x: parent.x + offset[0] * parent.width - self.anchor[0] * width,
            y: parent.y + offset[1] * parent.height - self.anchor[1] * height,
            width,
            height,
        };

        if let VisualKind::Sprite { color } = self.kind {
            out.push(PlacedSprite { rect, color });
        }
        for child in &self.children {
            child.layout_into(rect, elapsed, out);
        }
    }

    /// Purple background with a 50x50 white box sweeping between 10% and 90%
    /// of the width every 2 seconds.
    pub fn demo_scene() -> Self {
        let sweep = KeyframeAnimation::new(Duration::from_secs(2), true)
            .with_keyframe(0.0, [0.1, 0.5])
            .with_keyframe(0.5, [0.9, 0.5])
            .with_keyframe(1.0, [0.1, 0.5]);

        let background = Visual::sprite(Color::MEDIUM_PURPLE).with_relative_size(1.0, 1.0);
        let sweeping_box = Visual::sprite(Color::WHITE)
            .with_size(50.0, 50.0)
            .with_anchor(0.5, 0.5)
            .with_relative_offset(0.1, 0.5)
            .with_animation(sweep);

        Visual::container()
            .with_child_at_bottom(background)
            .with_child_on_top(sweeping_box)
    }
}
