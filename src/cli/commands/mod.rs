pub mod upgrade;

pub use upgrade::UpgradeCommand;
