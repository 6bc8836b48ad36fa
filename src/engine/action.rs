//! Reversible actions.
//!
//! An `Action` pairs a forward operation with its compensating operation
//! under a diagnostic name. The state an action needs to reverse itself is
//! captured when the action is built (by a registrar) and lives in an
//! explicit context struct implementing `Reversible`. Nothing in the
//! transaction is visible to it.

use anyhow::Result;
use std::fmt;

/// Forward/compensating operation pair over a captured context.
///
/// # Contract
///
/// - `apply()` performs the mutation. It fails with an operation-specific
///   error when the mutation cannot be completed and should not leave
///   partial state of its own behind.
/// - `undo()` reverses the mutation. It must not assume `apply()` succeeded
///   or was ever called, and must return `Ok(())` when there is nothing to
///   undo. It fails only when the system is unexpectedly inconsistent
///   (e.g. a backup that should exist is missing).
/// - `finish()` is called once a committed transaction is cleaned up, so
///   the action can discard backups it no longer needs. Failures there are
///   logged, never fatal.
pub trait Reversible {
    /// Perform the forward mutation
    fn apply(&self) -> Result<()>;

    /// Compensate for `apply`
    fn undo(&self) -> Result<()>;

    /// Discard captured backup state after a commit
    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// A named, immutable reversible step.
pub struct Action {
    name: String,
    op: Box<dyn Reversible>,
}

impl Action {
    /// Build an action from a context struct implementing `Reversible`.
    pub fn new(name: impl Into<String>, op: impl Reversible + 'static) -> Self {
        Self {
            name: name.into(),
            op: Box::new(op),
        }
    }

    /// Build an action from a pair of closures.
    ///
    /// Useful for one-off steps whose captured state is trivial.
    pub fn from_fns<A, U>(name: impl Into<String>, apply: A, undo: U) -> Self
    where
        A: Fn() -> Result<()> + 'static,
        U: Fn() -> Result<()> + 'static,
    {
        Self::new(name, FnPair { apply, undo })
    }

    /// Diagnostic name of this action
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn apply(&self) -> Result<()> {
        self.op.apply()
    }

    pub(crate) fn undo(&self) -> Result<()> {
        self.op.undo()
    }

    pub(crate) fn finish(&self) -> Result<()> {
        self.op.finish()
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action").field("name", &self.name).finish()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

struct FnPair<A, U> {
    apply: A,
    undo: U,
}

impl<A, U> Reversible for FnPair<A, U>
where
    A: Fn() -> Result<()>,
    U: Fn() -> Result<()>,
{
    fn apply(&self) -> Result<()> {
        (self.apply)()
    }

    fn undo(&self) -> Result<()> {
        (self.undo)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Counter {
        applied: Rc<Cell<u32>>,
        undone: Rc<Cell<u32>>,
    }

    impl Reversible for Counter {
        fn apply(&self) -> Result<()> {
            self.applied.set(self.applied.get() + 1);
            Ok(())
        }

        fn undo(&self) -> Result<()> {
            self.undone.set(self.undone.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn test_action_dispatches_to_context() {
        let applied = Rc::new(Cell::new(0));
        let undone = Rc::new(Cell::new(0));
        let action = Action::new(
            "count",
            Counter {
                applied: Rc::clone(&applied),
                undone: Rc::clone(&undone),
            },
        );

        action.apply().unwrap();
        action.undo().unwrap();

        assert_eq!(applied.get(), 1);
        assert_eq!(undone.get(), 1);
        assert!(action.finish().is_ok(), "default finish is a no-op");
    }

    #[test]
    fn test_from_fns_propagates_errors() {
        let action = Action::from_fns(
            "broken",
            || Err(anyhow::anyhow!("disk full")),
            || Ok(()),
        );

        let err = action.apply().unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert!(action.undo().is_ok());
    }

    #[test]
    fn test_action_name_and_debug() {
        let action = Action::from_fns("copy a -> b", || Ok(()), || Ok(()));
        assert_eq!(action.name(), "copy a -> b");
        assert_eq!(action.to_string(), "copy a -> b");
        assert!(format!("{:?}", action).contains("copy a -> b"));
    }
}
