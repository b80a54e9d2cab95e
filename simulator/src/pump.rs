use crate::telemetry::{ControlConfig, PumpCycle};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    On,
    Off,
}

/// Next phase of the misting cycle after `current`, or `None` when the pump
/// should stay in its current state until the configuration changes.
pub fn next_phase(cycle: &PumpCycle, current: PumpState) -> Option<(PumpState, Duration)> {
    let on = Duration::from_secs(cycle.on_for.max(0) as u64);
    let off = Duration::from_secs(cycle.off_for.max(0) as u64);

    match current {
        _ if on.is_zero() => None,
        _ if off.is_zero() => Some((PumpState::On, on)),
        PumpState::Off => Some((PumpState::On, on)),
        PumpState::On => Some((PumpState::Off, off)),
    }
}

/// Drives the mist pump from the latest configuration the device pulled.
/// Any new configuration restarts the cycle.
pub async fn run_pump_scheduler(mut controls: watch::Receiver<Option<ControlConfig>>) {
    let mut state = PumpState::Off;

    loop {
        let cycle = controls.borrow_and_update().as_ref().map(|c| c.pump_cycle);

        let Some(cycle) = cycle else {
            info!("Waiting for control configuration");
            if controls.changed().await.is_err() {
                return;
            }
            continue;
        };

        let Some((next, duration)) = next_phase(&cycle, state) else {
            if state != PumpState::Off {
                info!("Mist pump OFF (disabled)");
            }
            state = PumpState::Off;
            if controls.changed().await.is_err() {
                return;
            }
            continue;
        };

        if next != state {
            info!("Mist pump {:?} for {:?}", next, duration);
        }
        state = next;

        tokio::select! {
            _ = sleep(duration) => {}
            changed = controls.changed() => {
                if changed.is_err() {
                    return;
                }
                info!("Control configuration changed, restarting pump cycle");
                state = PumpState::Off;
            }
        }
    }
}
