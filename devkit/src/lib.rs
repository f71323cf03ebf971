/*!
# Sentinel DevKit

Collaborators and harnesses for exercising the kernel without a broker:
- [`RecordingConnections`]: in-memory agent links that record what the kernel sends
- [`AgentStub`]: builds correctly signed (or deliberately broken) agent messages
- [`FlakyGateway`]: a store that fails on demand
- [`TestHarness`]: a fully wired in-memory kernel
*/

pub mod agent;
pub mod connections;
pub mod flaky;
pub mod harness;

pub use agent::{AgentStub, MessageBuilder};
pub use connections::RecordingConnections;
pub use flaky::FlakyGateway;
pub use harness::{wait_until, TestHarness, TEST_SECRET};
