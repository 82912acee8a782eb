//! Listing hosts with a per-host deadline.

use std::cmp::Ordering;
use std::iter::Peekable;
use std::str::Chars;
use std::time::Duration;

use futures::{StreamExt, stream};
use serde::Serialize;
use tokio::time::{Instant, timeout};
use tracing::warn;

use super::{Controller, ControllerError, close};
use crate::driver::MachineState;
use crate::host::Host;

/// One row of `ls`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HostSummary {
    /// Host name.
    pub name: String,
    /// Registry name of the driver.
    pub driver_name: String,
    /// Observed state; `timeout` when the query missed its deadline.
    pub state: MachineState,
    /// Runtime endpoint of a running host.
    pub url: Option<String>,
    /// Why the state or URL could not be determined.
    pub error: Option<String>,
    /// How long the query took.
    #[serde(skip)]
    pub response_time: Duration,
}

impl Controller<'_> {
    /// Lists every stored host with its state and URL, in natural name
    /// order.
    ///
    /// A host whose query exceeds `list_timeout` is reported as
    /// [`MachineState::Timeout`]; its query keeps running in the background
    /// and its answer is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Store`] when the store cannot be listed.
    pub async fn list(&self) -> Result<Vec<HostSummary>, ControllerError> {
        let names = self.store.list_names()?;
        let deadline = self.settings.list_timeout;
        let mut summaries: Vec<HostSummary> = stream::iter(names)
            .map(|name| self.summarise(name, deadline))
            .buffer_unordered(self.settings.fanout_limit.max(1))
            .collect()
            .await;
        summaries.sort_by(|left, right| natural_cmp(&left.name, &right.name));
        Ok(summaries)
    }

    async fn summarise(&self, name: String, deadline: Duration) -> HostSummary {
        let mut host = match self.load(&name).await {
            Ok(host) => host,
            Err(err) => {
                return HostSummary {
                    name,
                    driver_name: String::new(),
                    state: MachineState::Error,
                    url: None,
                    error: Some(err.to_string()),
                    response_time: Duration::ZERO,
                };
            }
        };
        let driver_name = host.driver_name.clone();
        let started = Instant::now();
        let query = tokio::spawn(async move {
            let observed = observe(&host).await;
            close(&mut host).await;
            observed
        });
        match timeout(deadline, query).await {
            Ok(Ok((state, url, error))) => HostSummary {
                name,
                driver_name,
                state,
                url,
                error,
                response_time: started.elapsed(),
            },
            Ok(Err(join)) => HostSummary {
                name,
                driver_name,
                state: MachineState::Error,
                url: None,
                error: Some(format!("state query aborted: {join}")),
                response_time: started.elapsed(),
            },
            Err(_) => {
                warn!(machine = %name, deadline_secs = deadline.as_secs(), "state query timed out");
                HostSummary {
                    name,
                    driver_name,
                    state: MachineState::Timeout,
                    url: None,
                    error: Some(format!(
                        "driver did not answer within {}s",
                        deadline.as_secs()
                    )),
                    response_time: deadline,
                }
            }
        }
    }
}

async fn observe(host: &Host) -> (MachineState, Option<String>, Option<String>) {
    let state = match host.state().await {
        Ok(state) => state,
        Err(err) => return (MachineState::Error, None, Some(err.to_string())),
    };
    if state != MachineState::Running {
        return (state, None, None);
    }
    match host.url().await {
        Ok(url) => (state, Some(url), None),
        Err(err) => (state, None, Some(err.to_string())),
    }
}

/// Orders strings so embedded numbers compare by value: `m2` sorts before
/// `m10`.
#[must_use]
pub fn natural_cmp(left: &str, right: &str) -> Ordering {
    let mut lhs = left.chars().peekable();
    let mut rhs = right.chars().peekable();
    loop {
        let ordering = match (lhs.peek().copied(), rhs.peek().copied()) {
            (None, None) => return left.cmp(right),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(a), Some(b)) if a.is_ascii_digit() && b.is_ascii_digit() => {
                compare_numbers(&digits(&mut lhs), &digits(&mut rhs))
            }
            (Some(a), Some(b)) => {
                lhs.next();
                rhs.next();
                a.cmp(&b)
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
}

fn digits(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(digit) = chars.next_if(char::is_ascii_digit) {
        run.push(digit);
    }
    run
}

fn compare_numbers(left: &str, right: &str) -> Ordering {
    let lhs = left.trim_start_matches('0');
    let rhs = right.trim_start_matches('0');
    lhs.len().cmp(&rhs.len()).then_with(|| lhs.cmp(rhs))
}
