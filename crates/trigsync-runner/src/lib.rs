pub mod dispatch;
pub mod ground_truth;
pub mod protocol;
pub mod session;

pub use dispatch::{
    open_port, read_mirror_log, run_block_script, Clock, DispatchOutcome, Dispatcher,
    LoopbackCapture, LoopbackPort, MirrorLog, MirrorRecords, MonotonicClock, ScriptSummary,
    SerialDevicePort, SteppedClock, TransportError, TriggerEvent, TriggerPort,
};
pub use ground_truth::{expand, expand_block, expand_protocol, ExpectedTrigger};
pub use protocol::{
    assemble_from_parameters, assemble_protocol, block_seed, check_block_balance, generate_block,
    verify_reproducible, BlockSequence, Category, GenerationParameters, GenerationStamp, Protocol,
    TrialSpec, Variant,
};
pub use session::{
    ensure_block_storage, find_existing_blocks, find_subject_dirs, load_protocol,
    next_block_index, save_protocol, scan_session, BlockGuard, BlockPlan, BlockStorage,
    SessionError, SessionPhase, SessionState, SessionTracker,
};
