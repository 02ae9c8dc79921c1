// broker-test-support: in-process test doubles for the broker session core
// — a mock REST login gateway, a mock streaming broker endpoint, and a
// manually-advanced clock. Test-only by convention (not `cfg(test)`, since
// `broker-session`'s integration tests need it as an ordinary dev-dependency).

pub mod fake_clock;
pub mod mock_rest;
pub mod mock_ws;

pub use fake_clock::FakeClock;
pub use mock_rest::MockRestServer;
pub use mock_ws::MockBrokerServer;
