pub(crate) mod chain;

pub(crate) mod harness;

pub(crate) mod host;

pub(crate) mod logging;
