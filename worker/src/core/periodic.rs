//! Tick-driven periodic activities.
//!
//! A cooperative, single-threaded scheduler: the caller's loop calls
//! [`PeriodicActivities::tick`] at its own cadence (for example once per poll
//! of a running evaluation) and every registered activity counts down one unit
//! per tick. An activity fires after exactly `period` ticks.

use anyhow::{Result, bail};

/// Callback invoked when an activity's countdown expires.
pub type ActivityCallback<'a> = Box<dyn FnMut() -> Result<()> + 'a>;

/// Request to register one activity.
pub struct ActivityRequest<'a> {
    /// Re-arm after firing instead of becoming exhausted.
    pub repeating: bool,
    /// Number of ticks between firings. Must be positive.
    pub period: u32,
    pub callback: ActivityCallback<'a>,
}

impl<'a> ActivityRequest<'a> {
    pub fn repeating(period: u32, callback: impl FnMut() -> Result<()> + 'a) -> Self {
        Self {
            repeating: true,
            period,
            callback: Box::new(callback),
        }
    }

    pub fn once(period: u32, callback: impl FnMut() -> Result<()> + 'a) -> Self {
        Self {
            repeating: false,
            period,
            callback: Box::new(callback),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Countdown {
    Armed(u32),
    Exhausted,
}

struct Activity<'a> {
    repeating: bool,
    period: u32,
    callback: ActivityCallback<'a>,
    countdown: Countdown,
}

/// Set of activities serviced in registration order on every tick.
pub struct PeriodicActivities<'a> {
    activities: Vec<Activity<'a>>,
}

impl<'a> PeriodicActivities<'a> {
    pub fn new(requests: Vec<ActivityRequest<'a>>) -> Result<Self> {
        let mut activities = Vec::with_capacity(requests.len());
        for (index, request) in requests.into_iter().enumerate() {
            if request.period == 0 {
                bail!("activity {index}: period must be > 0");
            }
            activities.push(Activity {
                repeating: request.repeating,
                period: request.period,
                callback: request.callback,
                countdown: Countdown::Armed(request.period),
            });
        }
        Ok(Self { activities })
    }

    /// Advance every live activity by one tick, firing the expired ones.
    ///
    /// Always returns `Ok(true)`; stopping is the caller's decision. A callback
    /// error is returned immediately and later activities are not advanced
    /// during this tick.
    pub fn tick(&mut self) -> Result<bool> {
        for activity in &mut self.activities {
            let Countdown::Armed(remaining) = activity.countdown else {
                continue;
            };
            let remaining = remaining - 1;
            if remaining > 0 {
                activity.countdown = Countdown::Armed(remaining);
                continue;
            }
            activity.countdown = if activity.repeating {
                Countdown::Armed(activity.period)
            } else {
                Countdown::Exhausted
            };
            (activity.callback)()?;
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    /// True once a one-shot activity has fired. Out-of-range indexes are `false`.
    pub fn is_exhausted(&self, index: usize) -> bool {
        self.activities
            .get(index)
            .is_some_and(|activity| activity.countdown == Countdown::Exhausted)
    }
}
