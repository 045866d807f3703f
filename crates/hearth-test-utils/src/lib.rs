//! Shared test utilities: mock tools, a scripted dispatcher, in-memory
//! collaborators and a chain fixture builder.

pub mod fixture;
pub mod memory;
pub mod tools;

pub use fixture::{on_action, on_step, ChainFixture};
pub use memory::{MemoryChainSource, MemoryRecordSink};
pub use tools::{
    CountingTool, EchoTool, FailingTool, ScriptedDispatcher, SlowTool, SoftErrorTool, StaticTool,
};
