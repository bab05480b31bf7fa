pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::io::Write;
pub use tokio::sync::broadcast;

pub use crate::{
    channels::Channels,
    command::Command,
    config::{self, Config, ConfigWrapper},
    mqtt,
    options::Options,
    poller::Poller,
};
