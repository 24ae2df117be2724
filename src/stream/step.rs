/// Result of feeding one element to a sink, either asking for more or finishing.
///
/// `SinkStep` is what a [`Sink`](super::Sink) returns from its step function. A
/// finished sink may hand back the elements it did not use, so that whoever drives
/// it can offer them to the next consumer.
///
/// # Examples
///
/// ```rust
/// use spindle::SinkStep;
///
/// let running: SinkStep<i32, char> = SinkStep::Cont(3);
/// let finished: SinkStep<i32, char> = SinkStep::Done(3, vec!['x']);
///
/// assert_eq!(running.map_state(|n| n * 2), SinkStep::Cont(6));
/// assert_eq!(finished.into_parts(), (3, vec!['x']));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SinkStep<S, A> {
    /// Keep feeding elements
    Cont(S),
    /// Stop; the elements in the vector were not consumed
    Done(S, Vec<A>),
}

impl<S, A> SinkStep<S, A> {
    /// Finished with nothing left over.
    #[inline]
    pub fn done(state: S) -> Self {
        SinkStep::Done(state, Vec::new())
    }

    /// Returns `true` if the step is `Cont`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use spindle::SinkStep;
    ///
    /// let x: SinkStep<i32, u8> = SinkStep::Cont(1);
    /// assert!(x.is_cont());
    ///
    /// let y: SinkStep<i32, u8> = SinkStep::done(1);
    /// assert!(!y.is_cont());
    /// ```
    #[inline]
    pub const fn is_cont(&self) -> bool {
        matches!(self, SinkStep::Cont(_))
    }

    /// Returns `true` if the step is `Done`.
    #[inline]
    pub const fn is_done(&self) -> bool {
        matches!(self, SinkStep::Done(..))
    }

    /// The state, whichever variant this is.
    #[inline]
    pub fn state(&self) -> &S {
        match self {
            SinkStep::Cont(s) | SinkStep::Done(s, _) => s,
        }
    }

    /// Elements handed back by a finished sink. Empty for `Cont`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use spindle::SinkStep;
    ///
    /// let x: SinkStep<(), i32> = SinkStep::Done((), vec![4, 5]);
    /// assert_eq!(x.leftover(), &[4, 5]);
    ///
    /// let y: SinkStep<(), i32> = SinkStep::Cont(());
    /// assert!(y.leftover().is_empty());
    /// ```
    #[inline]
    pub fn leftover(&self) -> &[A] {
        match self {
            SinkStep::Cont(_) => &[],
            SinkStep::Done(_, rest) => rest,
        }
    }

    /// Splits into the state and the leftover elements.
    #[inline]
    pub fn into_parts(self) -> (S, Vec<A>) {
        match self {
            SinkStep::Cont(s) => (s, Vec::new()),
            SinkStep::Done(s, rest) => (s, rest),
        }
    }

    /// Maps a `SinkStep<S, A>` to `SinkStep<S2, A>` by applying a function to the state,
    /// leaving the variant and any leftover untouched.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use spindle::SinkStep;
    ///
    /// let x: SinkStep<i32, u8> = SinkStep::Done(2, vec![1]);
    /// assert_eq!(x.map_state(|s| s.to_string()), SinkStep::Done("2".to_string(), vec![1]));
    /// ```
    #[inline]
    pub fn map_state<S2, F>(self, f: F) -> SinkStep<S2, A>
    where
        F: FnOnce(S) -> S2,
    {
        match self {
            SinkStep::Cont(s) => SinkStep::Cont(f(s)),
            SinkStep::Done(s, rest) => SinkStep::Done(f(s), rest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_has_no_leftover() {
        let step: SinkStep<u8, u8> = SinkStep::done(1);
        assert!(step.is_done());
        assert_eq!(step.state(), &1);
        assert!(step.leftover().is_empty());
    }

    #[test]
    fn test_cont_into_parts() {
        let step: SinkStep<&str, u8> = SinkStep::Cont("s");
        assert_eq!(step.into_parts(), ("s", vec![]));
    }
}
