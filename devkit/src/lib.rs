/*!
# Inventory DevKit - fakes and helpers for tests

Runs the inventory engine without a real cloud:
- `FakeCloud`, an in-memory `RemoteInventory` with outage simulation
- builders for the remote records it serves
- `TestHarness`, a throwaway store wired to the fake cloud
*/

pub mod fake_cloud;
pub mod fixtures;
pub mod test_utils;

pub use fake_cloud::{CloudData, FakeCloud};
pub use test_utils::TestHarness;
