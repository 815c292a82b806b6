pub use crate::app::types::{
    AppHook, FirebaseAppInternals, FirebaseAuthTokenData, FirebaseService, FirebaseServiceFactory,
    FirebaseServiceInternals, FirebaseServiceNamespace, PlatformLoggerService, VersionService,
};

pub use crate::component::{Component, ComponentContainer};
