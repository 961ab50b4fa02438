use crate::{
    core::{
        errors::GraphError,
        fragment::{Fragment, LoadStrategy, MessageStrategy},
        MsgPayload, Payload,
    },
    engine::{context::FragmentContext, messages::MessageManager, parallel::ParallelEngine},
};

/// Per-round message volume estimate used to presize channel buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageVolume {
    pub send: usize,
    pub recv: usize,
}

/// A vertex-centric computation evaluated fragment-by-fragment in supersteps.
///
/// [`p_eval`] runs once in the first round; [`inc_eval`] runs in every later
/// round, consuming the messages sent in the round before. An application
/// never ends rounds itself: it sends, optionally calls
/// [`MessageManager::force_continue`], and returns. The worker owns the round
/// boundaries and the termination agreement.
///
/// [`p_eval`]: App::p_eval
/// [`inc_eval`]: App::inc_eval
pub trait App: Send + Sync + Sized + 'static {
    type VData: Payload + Default;
    type EData: Payload;
    type Msg: MsgPayload;
    type Ctx: FragmentContext<Self::VData, Self::EData>;

    /// How this application's messages travel; workers prepare the fragment's
    /// routing tables for it before the first round.
    const MESSAGE_STRATEGY: MessageStrategy;

    /// Edge directions the application reads. A fragment loaded `OnlyOut`
    /// cannot serve a `BothOutIn` application.
    const LOAD_STRATEGY: LoadStrategy;

    fn p_eval<MM: MessageManager<Self::Msg>>(
        &self,
        frag: &Fragment<Self::VData, Self::EData>,
        ctx: &mut Self::Ctx,
        messages: &mut MM,
        engine: &ParallelEngine,
    ) -> Result<(), GraphError>;

    fn inc_eval<MM: MessageManager<Self::Msg>>(
        &self,
        frag: &Fragment<Self::VData, Self::EData>,
        ctx: &mut Self::Ctx,
        messages: &mut MM,
        engine: &ParallelEngine,
    ) -> Result<(), GraphError>;

    /// Worst-case messages this fragment sends and receives in one round.
    /// The default declines to guess; channels then grow on demand.
    fn estimate_message_volume(
        &self,
        _frag: &Fragment<Self::VData, Self::EData>,
    ) -> MessageVolume {
        MessageVolume::default()
    }
}
