// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Lifecycle events of a run.

use crate::state::Strategy;

use std::fmt::{Debug, Formatter, Result as FmtResult};

/// Named points in the lifecycle of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Strategy was chosen and work is about to start.
    BeforeFetch { strategy: Strategy },

    /// Remote content landed in the temporary clone.
    AfterClone { revision: String },

    /// Installation batch finished.
    AfterInstall { installed: usize, failed: usize },

    /// Content was fresh, so nothing was fetched.
    Skipped { revision: Option<String> },

    /// Run failed.
    OnError { message: String },
}

type Listener = Box<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Fan lifecycle events out to registered listeners.
///
/// Listeners run synchronously in registration order.
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<Listener>,
}

impl EventBus {
    /// Construct new event bus without listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register listener for every event.
    pub fn subscribe(&mut self, listener: impl Fn(&LifecycleEvent) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Deliver event to every listener.
    pub fn emit(&self, event: LifecycleEvent) {
        for listener in &self.listeners {
            listener(&event);
        }
    }
}

impl Debug for EventBus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
