// SPDX-License-Identifier: MPL-2.0

//! Process-wide singletons. Each global slot is touched by exactly one test
//! in this binary.

use std::{sync::Arc, time::Duration};

use frameseq::{
    Configuration, ConfigurationError, DecodingExecutor, LogLevel, ManualClock, MemoryUsage,
};

#[test]
fn global_configuration_is_set_once() {
    assert!(!Configuration::is_initialized());

    let memory = MemoryUsage::new();
    let first = Configuration::builder()
        .log_level(LogLevel::Verbose)
        .min_time_to_render_next_frame(Duration::from_millis(16))
        .memory_usage(memory.clone())
        .clock(Arc::new(ManualClock::new()))
        .executor(Arc::new(DecodingExecutor::new(1).unwrap()))
        .build()
        .unwrap();
    let installed = Configuration::init(first).unwrap();
    assert!(Configuration::is_initialized());

    let second = Configuration::builder()
        .executor(Arc::new(DecodingExecutor::new(1).unwrap()))
        .build()
        .unwrap();
    assert!(matches!(
        Configuration::init(second),
        Err(ConfigurationError::AlreadyInitialized { .. })
    ));

    // The first configuration stays active.
    let global = Configuration::global().unwrap();
    assert!(Arc::ptr_eq(&installed, &global));
    assert!(global.is_verbose());
    assert_eq!(
        global.min_time_to_render_next_frame(),
        Duration::from_millis(16)
    );
    let _reservation = global.memory_usage().reserve(10);
    assert_eq!(memory.total_bytes(), 10);
}

#[test]
fn shared_executor_is_installed_once() {
    let installed = DecodingExecutor::install_shared(DecodingExecutor::new(2).unwrap()).unwrap();
    assert_eq!(installed.threads(), 2);

    let again = DecodingExecutor::install_shared(DecodingExecutor::new(1).unwrap());
    assert!(matches!(
        again,
        Err(ConfigurationError::AlreadyInitialized { .. })
    ));

    let shared = DecodingExecutor::shared().unwrap();
    assert!(Arc::ptr_eq(&installed, &shared));
}
