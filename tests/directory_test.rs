//! Context directory: id resolution, lifecycle and per-context isolation.
//!
//! Run with: `cargo test --test directory_test`

use isp_aic::config::SizingConfig;
use isp_aic::kernel::{KernelDescriptor, Section, TerminalType};
use isp_aic::results::{ExposureResult, ResultBundle};
use isp_aic::{
    AicConfig, AicDirectory, AicError, Collaborators, GroupConfig, InitParams, DEFAULT_CONTEXT_ID,
};
use std::sync::Arc;
use std::thread;

fn params(stream_ids: &[i32]) -> InitParams {
    InitParams::from_config(&AicConfig::default()).with_stream_ids(stream_ids.to_vec())
}

fn exposure(time_us: u32) -> ResultBundle {
    ResultBundle::new().with_exposure(ExposureResult {
        exposure_time_us: time_us,
        ..ExposureResult::default()
    })
}

#[test]
fn test_default_id_with_one_and_two_contexts() {
    let directory = AicDirectory::new(3);
    directory
        .init(&params(&[]), Collaborators::default())
        .unwrap();
    let only = directory.get_handle(DEFAULT_CONTEXT_ID).unwrap();
    assert_eq!(only.lock().id(), 0);
    directory.deinit();

    directory
        .init(&params(&[0, 1]), Collaborators::default())
        .unwrap();
    assert!(matches!(
        directory.get_handle(DEFAULT_CONTEXT_ID),
        Err(AicError::Ambiguous { count: 2 })
    ));
    assert_eq!(directory.get_handle(1).unwrap().lock().id(), 1);
    assert!(matches!(directory.get_handle(2), Err(AicError::NotFound(_))));
    assert!(matches!(
        directory.update_tuning(b"", None, DEFAULT_CONTEXT_ID),
        Err(AicError::Ambiguous { .. })
    ));
}

#[test]
fn test_lifecycle_errors() {
    let directory = AicDirectory::new(2);
    assert!(matches!(directory.get_handle(0), Err(AicError::NotInitialized)));
    assert!(matches!(directory.ids(), Err(AicError::NotInitialized)));

    assert!(matches!(
        directory.init(&params(&[0, 1, 2]), Collaborators::default()),
        Err(AicError::CapacityExceeded { capacity: 2, .. })
    ));
    assert!(!directory.is_initialized());

    directory.init(&params(&[4, 2]), Collaborators::default()).unwrap();
    assert_eq!(directory.ids().unwrap(), vec![2, 4]);
    assert!(matches!(
        directory.init(&params(&[0]), Collaborators::default()),
        Err(AicError::InvalidArgument(_))
    ));

    let handle = directory.get_handle(4).unwrap();
    directory.deinit();
    assert!(matches!(directory.get_handle(4), Err(AicError::NotInitialized)));
    // A handle taken before deinit still works but is detached
    handle.lock().save_results(1, &exposure(10));
    assert!(directory.is_empty());
}

#[test]
fn test_reinit_applies_new_sizing() {
    let directory = AicDirectory::new(1);
    directory.init(&params(&[3]), Collaborators::default()).unwrap();
    directory
        .with_context(DEFAULT_CONTEXT_ID, |ctx| {
            ctx.save_results(1, &exposure(10));
            Ok(())
        })
        .unwrap();

    let config = AicConfig {
        sizing: SizingConfig {
            result_cache_len: 2,
            ..SizingConfig::default()
        },
        ..AicConfig::default()
    };
    let reinit = InitParams::from_config(&config).with_maker_note(&b"note"[..]);
    directory.reinit(&reinit, 3).unwrap();

    let handle = directory.get_handle(3).unwrap();
    let ctx = handle.lock();
    assert_eq!(ctx.id(), 3);
    assert_eq!(ctx.result_cache().capacity(), 2);
    assert!(ctx.result_cache().is_empty());
    assert_eq!(ctx.maker_note().map(|n| &n[..]), Some(&b"note"[..]));
}

#[test]
fn test_contexts_are_isolated_across_threads() {
    let directory = Arc::new(AicDirectory::new(2));
    directory
        .init(&params(&[0, 1]), Collaborators::default())
        .unwrap();

    let workers: Vec<_> = [0, 1]
        .into_iter()
        .map(|id| {
            let directory = Arc::clone(&directory);
            thread::spawn(move || {
                let group = GroupConfig::new(id, 1)
                    .kernel(KernelDescriptor::new(100 + id as u32))
                    .offset(100 + id as u32, TerminalType::ParamIn, 0, 0, vec![Section::new(0, 32)]);
                for frame in 0..50u64 {
                    directory
                        .with_context(id, |ctx| {
                            if frame == 0 {
                                ctx.configure(&group)?;
                            }
                            ctx.save_results(frame, &exposure(id as u32 * 1000 + frame as u32));
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for id in [0, 1] {
        directory
            .with_context(id, |ctx| {
                assert_eq!(ctx.group_ids(), vec![id]);
                let latest = ctx.query_results(49);
                assert_eq!(
                    latest.exposure.map(|ae| ae.exposure_time_us),
                    Some(id as u32 * 1000 + 49)
                );
                Ok(())
            })
            .unwrap();
    }
}
