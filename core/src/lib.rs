//! # Tikit Realtime Core
//!
//! Core traits and types for the Tikit real-time synchronization layer.
//!
//! The synchronization layer keeps ticket capacity counters, group-buy progress,
//! spray-money leaderboards and user notifications live across a single gateway
//! channel. This crate holds the pieces every other crate shares:
//!
//! - **Reducer**: `(State, Action, Environment) → (State, Effects)`, the only place
//!   where session state changes
//! - **Effect**: descriptions of async work (calls, timers, inbound streams) executed
//!   by the runtime `Store`
//! - **Environment**: injected collaborators (clock, gateway, snapshot source,
//!   action dispatcher)
//! - **Domain ids**: [`topic::Topic`], [`topic::FilterKey`], [`topic::SubscriptionKey`]
//!   and friends
//!
//! ## Example
//!
//! ```ignore
//! use tikit_realtime_core::{effect::Effect, reducer::Reducer, SmallVec};
//!
//! impl Reducer for CounterReducer {
//!     type State = CounterState;
//!     type Action = CounterAction;
//!     type Environment = ();
//!
//!     fn reduce(
//!         &self,
//!         state: &mut CounterState,
//!         action: CounterAction,
//!         _env: &(),
//!     ) -> SmallVec<[Effect<CounterAction>; 4]> {
//!         state.count += 1;
//!         SmallVec::new()
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{smallvec, SmallVec};

/// Change notifications delivered by the gateway
pub mod change;

/// Action dispatch collaborator (REST side of the offline queue)
pub mod dispatch;

/// Snapshot fetch collaborator (`fetchCurrent`)
pub mod feed;

/// Bidirectional gateway channel abstraction
pub mod gateway;

/// Topics, filter keys and other strong identifiers
pub mod topic;

/// JSON encoding of gateway frames
pub mod wire;

/// Reducer module - The core trait for session logic
///
/// Reducers are deterministic: `(State, Action, Environment) → (State, Effects)`.
/// Everything asynchronous is described as an [`Effect`](effect::Effect) and
/// executed by the runtime, which feeds the resulting actions back in.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for session logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// Updates `state` in place and returns the effects the runtime must run.
        /// Implementations must not block and must not perform I/O directly.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects are values, not execution. A reducer returns them and the runtime
/// `Store` runs them, sending any produced action back through the reducer.
pub mod effect {
    use futures::Stream;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Effect type - describes a side effect to be executed
    ///
    /// # Type Parameters
    ///
    /// - `Action`: The action type that effects can produce (feedback loop)
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects in parallel
        Parallel(Vec<Effect<Action>>),

        /// Run effects sequentially, each one finishing before the next starts
        Sequential(Vec<Effect<Action>>),

        /// Delayed action (heartbeats, deadlines, backoff timers)
        Delay {
            /// How long to wait
            duration: Duration,
            /// Action to dispatch after delay
            action: Box<Action>,
        },

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is fed back into the reducer
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),

        /// Long-lived stream of actions, fed back in the order they are yielded
        ///
        /// Used for the inbound side of the gateway channel.
        Stream(Pin<Box<dyn Stream<Item = Action> + Send>>),
    }

    // Manual Debug implementation since Future and Stream don't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
                Effect::Stream(_) => write!(f, "Effect::Stream(<stream>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Schedule `action` after `duration`
        #[must_use]
        pub fn delay(duration: Duration, action: Action) -> Effect<Action> {
            Effect::Delay {
                duration,
                action: Box::new(action),
            }
        }

        /// Wrap an async block producing an optional follow-up action
        #[must_use]
        pub fn future<F>(fut: F) -> Effect<Action>
        where
            F: Future<Output = Option<Action>> + Send + 'static,
        {
            Effect::Future(Box::pin(fut))
        }

        /// Returns the delay duration if this is an [`Effect::Delay`]
        #[must_use]
        pub const fn delay_duration(&self) -> Option<Duration> {
            match self {
                Effect::Delay { duration, .. } => Some(*duration),
                _ => None,
            }
        }

        /// Returns the scheduled action if this is an [`Effect::Delay`]
        #[must_use]
        pub fn delayed_action(&self) -> Option<&Action> {
            match self {
                Effect::Delay { action, .. } => Some(action),
                _ => None,
            }
        }
    }
}

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the Environment parameter.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::effect::Effect;
    use std::time::Duration;

    #[test]
    fn delay_helpers_expose_duration_and_action() {
        let effect = Effect::delay(Duration::from_secs(2), 7_u32);
        assert_eq!(effect.delay_duration(), Some(Duration::from_secs(2)));
        assert_eq!(effect.delayed_action(), Some(&7));
        assert!(Effect::<u32>::None.delay_duration().is_none());
    }

    #[test]
    fn debug_does_not_require_polling() {
        let effect: Effect<u32> = Effect::future(async { Some(1) });
        assert_eq!(format!("{effect:?}"), "Effect::Future(<future>)");
    }
}
