//! Create / feed / delete lifecycle of the process-wide front end.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use audio_front_end::{
    AfeConfig, AfeError, AudioFrontEnd, LicenseGate, MONO_FRAME_SAMPLES, MemTag,
};
use common::{CountingAllocator, collecting_config, frame, serial};

// ═══════════════════════════════════════════════════════════════════════════════
// SINGLETON
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_second_create_is_rejected_until_delete() {
    let _guard = serial();

    let (config, _rx) = collecting_config(2);
    let mut first = AudioFrontEnd::create(config).unwrap();

    let (config, _rx2) = collecting_config(2);
    assert_eq!(
        AudioFrontEnd::create(config).err(),
        Some(AfeError::AlreadyInitialized)
    );

    first.delete(first.handle()).unwrap();

    let (config, _rx3) = collecting_config(2);
    let mut second = AudioFrontEnd::create(config).unwrap();
    assert_ne!(second.handle(), first.handle());
    second.delete(second.handle()).unwrap();
}

#[test]
fn test_drop_releases_the_instance() {
    let _guard = serial();

    let (config, _rx) = collecting_config(1);
    drop(AudioFrontEnd::create(config).unwrap());

    let (config, _rx) = collecting_config(1);
    let mut afe = AudioFrontEnd::create(config).unwrap();
    afe.delete(afe.handle()).unwrap();
}

#[test]
fn test_delete_with_stale_handle_tears_nothing_down() {
    let _guard = serial();

    let (config, _rx) = collecting_config(1);
    let mut old = AudioFrontEnd::create(config).unwrap();
    let stale = old.handle();
    old.delete(stale).unwrap();
    assert!(matches!(old.delete(stale), Err(AfeError::BadArg(_))));

    let (config, rx) = collecting_config(1);
    let mut live = AudioFrontEnd::create(config).unwrap();
    assert!(matches!(live.delete(stale), Err(AfeError::BadArg(_))));

    // still running
    live.feed(frame(7, 1), None).unwrap();
    let delivered = rx.recv_timeout(common::TIMEOUT).unwrap();
    assert_eq!(delivered.output[0], 7);

    live.delete(live.handle()).unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_create_rejects_incomplete_config() {
    let _guard = serial();

    let no_callback = AfeConfig {
        filter_settings: Some(vec![1]),
        ..AfeConfig::default()
    };
    assert!(matches!(
        AudioFrontEnd::create(no_callback),
        Err(AfeError::BadArg(_))
    ));

    let (mut no_filters, _rx) = collecting_config(1);
    no_filters.filter_settings = Some(Vec::new());
    assert!(matches!(
        AudioFrontEnd::create(no_filters),
        Err(AfeError::BadArg(_))
    ));

    let (mut half_allocator, _rx) = collecting_config(1);
    half_allocator.alloc_memory = Some(CountingAllocator::default().callbacks().0);
    assert!(matches!(
        AudioFrontEnd::create(half_allocator),
        Err(AfeError::BadArg(_))
    ));

    let (config, _rx) = collecting_config(3);
    assert!(matches!(
        AudioFrontEnd::create(config),
        Err(AfeError::BadArg(_))
    ));

    let (mut no_queue, _rx) = collecting_config(1);
    no_queue.queue_capacity = 0;
    assert!(matches!(
        AudioFrontEnd::create(no_queue),
        Err(AfeError::BadArg(_))
    ));

    // none of the above claimed the instance
    let (config, _rx) = collecting_config(1);
    let mut afe = AudioFrontEnd::create(config).unwrap();
    afe.delete(afe.handle()).unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// MEMORY
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_every_region_goes_back_to_the_provider() {
    let _guard = serial();

    let allocator = CountingAllocator::default();
    let (alloc, free) = allocator.callbacks();
    let (mut config, rx) = collecting_config(2);
    config.alloc_memory = Some(alloc);
    config.free_memory = Some(free);

    let mut afe = AudioFrontEnd::create(config).unwrap();
    let feeder = afe.feeder();
    assert_eq!(allocator.allocated(MemTag::AfeContext), 1);
    assert!(allocator.allocated(MemTag::AlgorithmPersistentMemory) >= 1);
    if cfg!(feature = "tuning") {
        assert!(allocator.allocated(MemTag::AfeDbgOutBuffer) > 4);
    }

    for i in 0..5 {
        feeder.feed(frame(i, 2), None).unwrap();
    }
    for _ in 0..5 {
        rx.recv_timeout(common::TIMEOUT).unwrap();
    }
    assert_eq!(allocator.allocated(MemTag::AfeOutputBuffer), 1);

    afe.delete(afe.handle()).unwrap();
    assert_eq!(allocator.outstanding(), 0);

    // a leftover feeder holds the context but not its buffers
    assert!(matches!(
        feeder.feed(frame(1, 2), None),
        Err(AfeError::BadArg(_))
    ));
    drop(feeder);
    assert_eq!(allocator.outstanding(), 0);
}

#[test]
fn test_failed_allocation_unwinds_create() {
    let _guard = serial();

    let allocator = CountingAllocator::default();
    allocator.fail_on(MemTag::AlgorithmScratchMemory);
    let (alloc, free) = allocator.callbacks();
    let (mut config, _rx) = collecting_config(2);
    config.alloc_memory = Some(alloc);
    config.free_memory = Some(free);

    assert!(matches!(
        AudioFrontEnd::create(config),
        Err(AfeError::OutOfMemory {
            tag: MemTag::AlgorithmScratchMemory,
            ..
        })
    ));
    assert_eq!(allocator.outstanding(), 0);

    let (config, _rx) = collecting_config(2);
    let mut afe = AudioFrontEnd::create(config).unwrap();
    afe.delete(afe.handle()).unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// FEED CHECKS
// ═══════════════════════════════════════════════════════════════════════════════

struct SwitchLicense(AtomicBool);

impl LicenseGate for SwitchLicense {
    fn is_expired(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[test]
fn test_expired_license_blocks_feeding() {
    let _guard = serial();

    let license = Arc::new(SwitchLicense(AtomicBool::new(false)));
    let (mut config, rx) = collecting_config(1);
    config.license = Some(license.clone());
    let mut afe = AudioFrontEnd::create(config).unwrap();

    afe.feed(frame(1, 1), None).unwrap();
    rx.recv_timeout(common::TIMEOUT).unwrap();

    license.0.store(true, Ordering::SeqCst);
    assert_eq!(
        afe.feed(frame(2, 1), None),
        Err(AfeError::FunctionalityRestricted)
    );
    assert_eq!(
        afe.feed_from_isr(frame(2, 1), None),
        Err(AfeError::FunctionalityRestricted)
    );
    assert_eq!(afe.context().stats().frames_fed, 1);

    afe.delete(afe.handle()).unwrap();
}

#[test]
fn test_malformed_frames_are_rejected() {
    let _guard = serial();

    let (config, _rx) = collecting_config(2);
    let mut afe = AudioFrontEnd::create(config).unwrap();

    // mono frame into a stereo front end
    assert!(matches!(
        afe.feed(frame(1, 1), None),
        Err(AfeError::BadArg(_))
    ));
    let short_ref: Arc<[i16]> = vec![0; MONO_FRAME_SAMPLES - 1].into();
    assert!(matches!(
        afe.feed(frame(1, 2), Some(short_ref)),
        Err(AfeError::BadArg(_))
    ));
    assert_eq!(afe.context().stats().frames_fed, 0);

    let handle = afe.handle();
    afe.delete(handle).unwrap();
    assert!(matches!(
        afe.feed(frame(1, 2), None),
        Err(AfeError::BadArg(_))
    ));
}
