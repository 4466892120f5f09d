/// Threads top-level and subcommand args through dispatch, in the shape of
/// the teacher's `Context<A, B>` (`examples/beyondessential-bestool/crates/bestool/src/actions/context.rs`).
/// No `MultiProgress` field: this daemon's subcommands are unattended
/// (`run`) or operate on directory trees rather than byte streams
/// (`list`/`restore`/`purge`), so there is no natural progress bar to drive
/// — see DESIGN.md for the explicit note on dropping `indicatif`.
#[derive(Clone, Debug)]
pub struct Context<A = (), B = ()> {
    pub args_top: A,
    pub args_sub: B,
}

impl Context {
    pub fn new() -> Self {
        Self { args_top: (), args_sub: () }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl<A, B> Context<A, B> {
    pub fn with_top<C>(self, args_top: C) -> Context<C, B> {
        Context::<C, B> { args_top, args_sub: self.args_sub }
    }

    pub fn with_sub<C>(self, args_sub: C) -> Context<A, C> {
        Context::<A, C> { args_top: self.args_top, args_sub }
    }

    pub fn take_top(self) -> (A, Context<(), B>) {
        (self.args_top, Context::<(), B> { args_top: (), args_sub: self.args_sub })
    }
}
