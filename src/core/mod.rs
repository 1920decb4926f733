pub(crate) mod events;
pub(crate) mod inspect;
pub(crate) mod kube;
pub(crate) mod logger;
pub(crate) mod signals;
