//! Scripted call progress used when no SIP relay is reachable.

use log::debug;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const RING_AFTER: Duration = Duration::from_secs(1);
pub const ANSWER_AFTER_RING: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedStep {
    Ringing,
    Answered,
}

/// Plays out ringing then answer, calling `on_step` for each. Aborting the
/// handle stops the script.
pub fn spawn<F>(on_step: F) -> JoinHandle<()>
where
    F: Fn(SimulatedStep) + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(RING_AFTER).await;
        debug!(target: "Call/Simulation", "Simulated far end ringing");
        on_step(SimulatedStep::Ringing);
        tokio::time::sleep(ANSWER_AFTER_RING).await;
        debug!(target: "Call/Simulation", "Simulated far end answered");
        on_step(SimulatedStep::Answered);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    const SLACK: Duration = Duration::from_millis(10);

    #[tokio::test(start_paused = true)]
    async fn test_steps_fire_at_one_and_three_seconds() {
        let started = Instant::now();
        let steps = Arc::new(Mutex::new(Vec::new()));
        let recorded = steps.clone();
        let handle = spawn(move |step| {
            recorded.lock().unwrap().push((step, started.elapsed()));
        });
        handle.await.unwrap();

        let steps = steps.lock().unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].0, SimulatedStep::Ringing);
        assert!(steps[0].1 >= RING_AFTER && steps[0].1 < RING_AFTER + SLACK);
        assert_eq!(steps[1].0, SimulatedStep::Answered);
        let answered = RING_AFTER + ANSWER_AFTER_RING;
        assert!(steps[1].1 >= answered && steps[1].1 < answered + SLACK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_before_answer() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let recorded = steps.clone();
        let handle = spawn(move |step| recorded.lock().unwrap().push(step));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.abort();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*steps.lock().unwrap(), vec![SimulatedStep::Ringing]);
    }
}
