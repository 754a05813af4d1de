use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::commit::LegacyModeset;
use crate::device::{FlipEvent, KmsDevice};
use crate::error::{KmsError, KmsResult};

/// What to do when a flip is requested while the previous one has not
/// completed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingFlipPolicy {
    /// Block until the pending flip completes, up to the cycle's timeout.
    #[default]
    Wait,
    /// Fail with [`KmsError::FlipPending`].
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipState {
    Idle,
    FlipRequested { framebuffer: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlipStats {
    pub flips: usize,
    pub completed: usize,
    pub stray_events: usize,
}

/// Alternates two framebuffers on an already active CRTC.
///
/// Every flip asks for a completion event and the next flip is only issued
/// once that event has been seen. Events for other CRTCs, or arriving while
/// nothing is pending, are counted as stray and otherwise ignored.
pub struct FlipCycle<'d, D: KmsDevice> {
    device: &'d D,
    legacy: LegacyModeset<'d, D>,
    crtc: u32,
    framebuffers: [u32; 2],
    next: usize,
    state: FlipState,
    policy: PendingFlipPolicy,
    timeout: Duration,
    stats: FlipStats,
}

impl<'d, D: KmsDevice> FlipCycle<'d, D> {
    /// `framebuffers[0]` is shown by the first flip.
    pub fn new(
        device: &'d D,
        crtc: u32,
        framebuffers: [u32; 2],
        policy: PendingFlipPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            device,
            legacy: LegacyModeset::new(device),
            crtc,
            framebuffers,
            next: 0,
            state: FlipState::Idle,
            policy,
            timeout,
            stats: FlipStats::default(),
        }
    }

    pub fn state(&self) -> FlipState {
        self.state
    }

    pub fn stats(&self) -> FlipStats {
        self.stats
    }

    /// Requests a flip to the next framebuffer and returns its id.
    pub fn flip(&mut self) -> KmsResult<u32> {
        if let FlipState::FlipRequested { .. } = self.state {
            match self.policy {
                PendingFlipPolicy::Wait => self.wait(self.timeout)?,
                PendingFlipPolicy::Reject => {
                    self.drain(Duration::ZERO)?;
                    if self.state != FlipState::Idle {
                        return Err(KmsError::FlipPending { crtc: self.crtc });
                    }
                }
            }
        }

        let framebuffer = self.framebuffers[self.next];
        self.legacy.page_flip(self.crtc, framebuffer, true)?;
        log::debug!("Flip to framebuffer {} requested on crtc {}", framebuffer, self.crtc);

        self.state = FlipState::FlipRequested { framebuffer };
        self.next ^= 1;
        self.stats.flips += 1;
        Ok(framebuffer)
    }

    /// Blocks until the pending flip completes. Returns immediately when idle.
    pub fn wait(&mut self, timeout: Duration) -> KmsResult<()> {
        let deadline = Instant::now() + timeout;
        while self.state != FlipState::Idle {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(KmsError::FlipTimeout {
                    crtc: self.crtc,
                    millis: timeout.as_millis(),
                });
            }
            self.drain(remaining)?;
        }
        Ok(())
    }

    /// Flips `cycles` times, then waits for the last flip. Each flip is
    /// preceded by `interval`, so the buffer already on screen when the cycle
    /// starts is shown for a full period too.
    pub fn run(&mut self, cycles: usize, interval: Duration) -> KmsResult<FlipStats> {
        log::info!(
            "Flipping crtc {} between framebuffers {:?}, {} times every {:?}",
            self.crtc,
            self.framebuffers,
            cycles,
            interval
        );
        for _ in 0..cycles {
            if !interval.is_zero() {
                std::thread::sleep(interval);
            }
            self.flip()?;
        }
        self.wait(self.timeout)?;

        log::info!(
            "Flip cycle done: {} flips, {} completed, {} stray events",
            self.stats.flips,
            self.stats.completed,
            self.stats.stray_events
        );
        Ok(self.stats)
    }

    /// Reads whatever completion events arrive within `timeout`.
    pub fn drain(&mut self, timeout: Duration) -> KmsResult<()> {
        let events = self
            .device
            .read_flip_events(timeout)
            .map_err(KmsError::Events)?;
        for event in events {
            self.handle_event(event);
        }
        Ok(())
    }

    fn handle_event(&mut self, event: FlipEvent) {
        match self.state {
            FlipState::FlipRequested { framebuffer } if event.crtc == self.crtc => {
                log::trace!(
                    "Flip to framebuffer {} completed on crtc {} (frame {})",
                    framebuffer,
                    event.crtc,
                    event.frame
                );
                self.state = FlipState::Idle;
                self.stats.completed += 1;
            }
            _ => {
                log::warn!(
                    "Ignoring stray flip event for crtc {} (frame {})",
                    event.crtc,
                    event.frame
                );
                self.stats.stray_events += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PlaneLayout;
    use crate::mode::DisplayMode;
    use crate::virt::VirtualCard;
    use drm_fourcc::DrmFourcc;

    const CRTC: u32 = 38;

    fn framebuffer(card: &VirtualCard) -> u32 {
        let dumb = card.create_dumb_buffer(1920, 1080, 32).unwrap();
        card.add_framebuffer(
            1920,
            1080,
            DrmFourcc::Xrgb8888,
            &PlaneLayout::single(dumb.handle, dumb.pitch, 0),
        )
        .unwrap()
    }

    fn active(card: &VirtualCard) -> [u32; 2] {
        let a = framebuffer(card);
        let b = framebuffer(card);
        card.set_crtc(CRTC, a, (0, 0), &[40], &DisplayMode::with_size(1920, 1080))
            .unwrap();
        [b, a]
    }

    #[test]
    fn alternates_and_tracks_completion() {
        let card = VirtualCard::new();
        let fbs = active(&card);
        let mut cycle = FlipCycle::new(&card, CRTC, fbs, PendingFlipPolicy::Wait, Duration::from_millis(50));

        assert_eq!(cycle.flip().unwrap(), fbs[0]);
        assert_eq!(cycle.state(), FlipState::FlipRequested { framebuffer: fbs[0] });
        assert_eq!(cycle.flip().unwrap(), fbs[1]);
        assert_eq!(cycle.flip().unwrap(), fbs[0]);
        cycle.wait(Duration::from_millis(50)).unwrap();
        assert_eq!(cycle.state(), FlipState::Idle);
        assert_eq!(card.scanout(CRTC), Some(fbs[0]));

        let stats = cycle.stats();
        assert_eq!(stats.flips, 3);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.stray_events, 0);
    }

    #[test]
    fn run_counts_every_flip() {
        let card = VirtualCard::new();
        let fbs = active(&card);
        let mut cycle = FlipCycle::new(&card, CRTC, fbs, PendingFlipPolicy::Wait, Duration::from_millis(50));
        let stats = cycle.run(10, Duration::ZERO).unwrap();
        assert_eq!(stats.flips, 10);
        assert_eq!(stats.completed, 10);
        // Ten flips starting from fbs[0] leave fbs[1] on screen.
        assert_eq!(card.scanout(CRTC), Some(fbs[1]));
    }

    #[test]
    fn every_buffer_stays_up_for_the_interval() {
        let card = VirtualCard::new();
        let fbs = active(&card);
        let interval = Duration::from_millis(30);
        let mut cycle = FlipCycle::new(&card, CRTC, fbs, PendingFlipPolicy::Wait, Duration::from_millis(50));
        cycle.run(3, interval).unwrap();

        let history = card.scanout_history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].framebuffer, fbs[1]);
        for pair in history.windows(2) {
            let shown = pair[1].at.duration_since(pair[0].at);
            assert!(shown >= interval, "framebuffer {} shown for {:?}", pair[0].framebuffer, shown);
        }
    }

    #[test]
    fn reject_policy_refuses_second_flip() {
        let card = VirtualCard::builder().withhold_flip_events(true).build();
        let fbs = active(&card);
        let mut cycle = FlipCycle::new(&card, CRTC, fbs, PendingFlipPolicy::Reject, Duration::from_millis(10));
        cycle.flip().unwrap();
        assert!(matches!(cycle.flip(), Err(KmsError::FlipPending { crtc: CRTC })));
        assert_eq!(card.calls().page_flip, 1);
    }

    #[test]
    fn wait_policy_times_out() {
        let card = VirtualCard::builder().withhold_flip_events(true).build();
        let fbs = active(&card);
        let mut cycle = FlipCycle::new(&card, CRTC, fbs, PendingFlipPolicy::Wait, Duration::from_millis(10));
        cycle.flip().unwrap();
        assert!(matches!(
            cycle.flip(),
            Err(KmsError::FlipTimeout { crtc: CRTC, millis: 10 })
        ));
    }

    #[test]
    fn stray_events_do_not_complete_flips() {
        let card = VirtualCard::builder().withhold_flip_events(true).build();
        let fbs = active(&card);
        let mut cycle = FlipCycle::new(&card, CRTC, fbs, PendingFlipPolicy::Wait, Duration::from_millis(10));

        card.inject_flip_event(FlipEvent { crtc: CRTC, frame: 1 });
        cycle.drain(Duration::ZERO).unwrap();
        assert_eq!(cycle.state(), FlipState::Idle);

        cycle.flip().unwrap();
        card.inject_flip_event(FlipEvent { crtc: 99, frame: 2 });
        assert!(cycle.wait(Duration::from_millis(10)).is_err());

        let stats = cycle.stats();
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.stray_events, 2);
    }
}
