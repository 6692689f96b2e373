// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::time::Duration;

use crate::error::Result;

use super::{LocalResource, PlacedSprite, Rect, Visual};

/// What a host window displays.
///
/// The host binds its handle on the shared resource here; composing then
/// lays out whatever content the worker bound, with no extra round trip.
#[derive(Debug)]
pub struct CompositionTarget {
    root: Option<LocalResource>,
    /// Parsed root content. Set once: a bound root never changes.
    content: Option<Visual>,
    extent: (f32, f32),
}

impl CompositionTarget {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            root: None,
            content: None,
            extent: (width, height),
        }
    }

    pub fn set_root(&mut self, resource: LocalResource) {
        tracing::debug!(
            resource_id = format_args!("{:#x}", resource.resource_id()),
            "Shared resource set as window root"
        );
        self.root = Some(resource);
        self.content = None;
    }

    pub fn root(&self) -> Option<&LocalResource> {
        self.root.as_ref()
    }

    pub fn extent(&self) -> (f32, f32) {
        self.extent
    }

    pub fn resize(&mut self, width: f32, height: f32) {
        self.extent = (width, height);
    }

    /// Sprites on screen at `elapsed`. Empty until content is bound.
    pub fn compose(&mut self, elapsed: Duration) -> Result<Vec<PlacedSprite>> {
        if self.content.is_none() {
            let Some(resource) = &self.root else {
                return Ok(Vec::new());
            };
            self.content = resource.root()?;
        }
        let Some(content) = &self.content else {
            return Ok(Vec::new());
        };
        let (width, height) = self.extent;
        Ok(content.layout(Rect::from_size(width, height), elapsed))
    }
}
