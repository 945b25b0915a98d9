//! Mutex and condition variable - parking_lot if available, std otherwise.
//!
//! Both flavours expose the parking_lot calling convention: `lock()` returns
//! the guard directly and `Condvar::wait` takes `&mut MutexGuard`.

#[cfg(feature = "parking_lot")]
pub use parking_lot::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};

#[cfg(not(feature = "parking_lot"))]
mod std_mutex {
    use std::sync::{
        Condvar as StdCondvar, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError,
    };
    use std::time::Duration;

    /// Thin wrapper around std::sync::Mutex.
    ///
    /// Poisoning is ignored: a panic while holding a pool or memory lock must
    /// not turn every later release into a second panic.
    pub struct Mutex<T>(StdMutex<T>);

    impl<T> Mutex<T> {
        /// Create a new mutex.
        pub const fn new(value: T) -> Self {
            Self(StdMutex::new(value))
        }

        /// Lock the mutex.
        pub fn lock(&self) -> MutexGuard<'_, T> {
            MutexGuard(Some(self.0.lock().unwrap_or_else(PoisonError::into_inner)))
        }

        /// Consume the mutex and return the inner value.
        pub fn into_inner(self) -> T {
            self.0.into_inner().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl<T: Default> Default for Mutex<T> {
        fn default() -> Self {
            Self::new(T::default())
        }
    }

    /// Guard for std mutex.
    ///
    /// The inner guard is only `None` while a [`Condvar`] wait owns it.
    pub struct MutexGuard<'a, T>(Option<StdMutexGuard<'a, T>>);

    impl<'a, T> std::ops::Deref for MutexGuard<'a, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            self.0.as_deref().expect("mutex guard held by condvar wait")
        }
    }

    impl<'a, T> std::ops::DerefMut for MutexGuard<'a, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            self.0.as_deref_mut().expect("mutex guard held by condvar wait")
        }
    }

    /// Result of a timed condvar wait.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitTimeoutResult(bool);

    impl WaitTimeoutResult {
        /// Whether the wait ended because the timeout elapsed.
        pub fn timed_out(&self) -> bool {
            self.0
        }
    }

    /// Thin wrapper around std::sync::Condvar.
    #[derive(Default)]
    pub struct Condvar(StdCondvar);

    impl Condvar {
        /// Create a new condition variable.
        pub const fn new() -> Self {
            Self(StdCondvar::new())
        }

        /// Block until notified, releasing the guard while waiting.
        pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) {
            let inner = guard.0.take().expect("mutex guard held by condvar wait");
            guard.0 = Some(self.0.wait(inner).unwrap_or_else(PoisonError::into_inner));
        }

        /// Block until notified or until `timeout` elapses.
        pub fn wait_for<T>(
            &self,
            guard: &mut MutexGuard<'_, T>,
            timeout: Duration,
        ) -> WaitTimeoutResult {
            let inner = guard.0.take().expect("mutex guard held by condvar wait");
            let (inner, result) = self
                .0
                .wait_timeout(inner, timeout)
                .unwrap_or_else(PoisonError::into_inner);
            guard.0 = Some(inner);
            WaitTimeoutResult(result.timed_out())
        }

        /// Wake one waiter.
        pub fn notify_one(&self) {
            self.0.notify_one();
        }

        /// Wake all waiters.
        pub fn notify_all(&self) {
            self.0.notify_all();
        }
    }
}

#[cfg(not(feature = "parking_lot"))]
pub use std_mutex::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_condvar_wakes_waiter() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let pair2 = Arc::clone(&pair);

        let handle = thread::spawn(move || {
            let (lock, cond) = &*pair2;
            *lock.lock() = true;
            cond.notify_one();
        });

        let (lock, cond) = &*pair;
        let mut ready = lock.lock();
        while !*ready {
            cond.wait(&mut ready);
        }
        assert!(*ready);
        drop(ready);
        handle.join().unwrap();
    }

    #[test]
    fn test_condvar_timeout() {
        let lock = Mutex::new(0u32);
        let cond = Condvar::new();

        let mut guard = lock.lock();
        let result = cond.wait_for(&mut guard, Duration::from_millis(10));
        assert!(result.timed_out());
        *guard += 1;
        assert_eq!(*guard, 1);
    }
}
