// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Windows the controllers service.
//!
//! Window creation and message dispatch belong to the embedding toolkit.
//! Controllers only poll a [`Window`] for events between handshake steps and
//! hand it each composed frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use signal_hook::SigId;

use crate::bridge::PlacedSprite;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    Resized { width: u32, height: u32 },
    CloseRequested,
}

pub trait Window {
    /// Current client-area size in pixels.
    fn client_size(&self) -> (u32, u32);

    /// Wait up to `timeout` for the next event. Must not block longer.
    fn poll_event(&mut self, timeout: Duration) -> Result<Option<WindowEvent>>;

    /// Display a composed frame.
    fn present(&mut self, _frame: &[PlacedSprite]) {}
}

/// Injects events into a [`HeadlessWindow`] from anywhere.
#[derive(Debug, Clone)]
pub struct WindowHandle {
    events: Sender<WindowEvent>,
}

impl WindowHandle {
    pub fn resize(&self, width: u32, height: u32) {
        let _ = self.events.send(WindowEvent::Resized { width, height });
    }

    pub fn close(&self) {
        let _ = self.events.send(WindowEvent::CloseRequested);
    }
}

/// A window with no display.
///
/// Events arrive through [`WindowHandle`]s and, when enabled, from
/// `SIGINT`/`SIGTERM`, which request a close.
pub struct HeadlessWindow {
    size: (u32, u32),
    sender: Sender<WindowEvent>,
    events: Receiver<WindowEvent>,
    close_signal: Arc<AtomicBool>,
    signal_ids: Vec<SigId>,
    last_frame: Vec<PlacedSprite>,
    frames_presented: u64,
}

impl HeadlessWindow {
    pub fn new(width: u32, height: u32) -> Self {
        let (sender, events) = crossbeam_channel::unbounded();
        Self {
            size: (width, height),
            sender,
            events,
            close_signal: Arc::new(AtomicBool::new(false)),
            signal_ids: Vec::new(),
            last_frame: Vec::new(),
            frames_presented: 0,
        }
    }

    /// Treat `SIGINT` and `SIGTERM` as a close request.
    pub fn close_on_signals(mut self) -> Result<Self> {
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            let id = signal_hook::flag::register(signal, Arc::clone(&self.close_signal))?;
            self.signal_ids.push(id);
        }
        tracing::debug!("Headless window closes on SIGINT/SIGTERM");
        Ok(self)
    }

    pub fn handle(&self) -> WindowHandle {
        WindowHandle {
            events: self.sender.clone(),
        }
    }

    pub fn last_frame(&self) -> &[PlacedSprite] {
        &self.last_frame
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }
}

impl Window for HeadlessWindow {
    fn client_size(&self) -> (u32, u32) {
        self.size
    }

    fn poll_event(&mut self, timeout: Duration) -> Result<Option<WindowEvent>> {
        if self.close_signal.swap(false, Ordering::AcqRel) {
            tracing::info!("Close requested by signal");
            return Ok(Some(WindowEvent::CloseRequested));
        }

        let event = match self.events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return Ok(None),
        };
        if let WindowEvent::Resized { width, height } = event {
            self.size = (width, height);
        }
        Ok(Some(event))
    }

    fn present(&mut self, frame: &[PlacedSprite]) {
        self.last_frame.clear();
        self.last_frame.extend_from_slice(frame);
        self.frames_presented += 1;
    }
}

impl Drop for HeadlessWindow {
    fn drop(&mut self) {
        for id in self.signal_ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_events_arrive_in_order() {
        let mut window = HeadlessWindow::new(800, 600);
        let handle = window.handle();
        handle.resize(1024, 768);
        handle.close();

        assert_eq!(
            window.poll_event(Duration::ZERO).unwrap(),
            Some(WindowEvent::Resized { width: 1024, height: 768 })
        );
        assert_eq!(window.client_size(), (1024, 768));
        assert_eq!(
            window.poll_event(Duration::ZERO).unwrap(),
            Some(WindowEvent::CloseRequested)
        );
        assert_eq!(window.poll_event(Duration::from_millis(5)).unwrap(), None);
    }

    #[test]
    fn events_from_another_thread_wake_the_poll() {
        let mut window = HeadlessWindow::new(1, 1);
        let handle = window.handle();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.close();
        });
        assert_eq!(
            window.poll_event(Duration::from_secs(5)).unwrap(),
            Some(WindowEvent::CloseRequested)
        );
        sender.join().unwrap();
    }

    #[test]
    fn present_keeps_the_latest_frame() {
        let mut window = HeadlessWindow::new(1, 1);
        let frame = crate::bridge::Visual::demo_scene()
            .layout(crate::bridge::Rect::from_size(10.0, 10.0), Duration::ZERO);
        window.present(&frame);
        window.present(&frame[..1]);
        assert_eq!(window.last_frame().len(), 1);
        assert_eq!(window.frames_presented(), 2);
    }
}
