mod common;

use common::{run, Completion, Env, MockDevice, BUF};
use defines::error::{errno, KResult};
use dio::{BlockMapping, DioConfig, DirectIo, Direction, IoSegment};
use memory::VirtAddr;

/// 每 4 个块之后设备块号跳开一段，32 页的缓冲区正好切成 8 个批次
fn gapped(block: u64, _create: bool) -> KResult<BlockMapping> {
    Ok(BlockMapping::mapped(block + block / 4 * 100))
}

fn buffer(pages: usize) -> IoSegment {
    IoSegment::new(VirtAddr(BUF), pages * 4096)
}

#[test]
fn completion_order_does_not_matter() {
    for mode in [
        Completion::InOrder,
        Completion::Reverse,
        Completion::Shuffled(1),
        Completion::Shuffled(99),
        Completion::Thread,
    ] {
        let env = Env::rw();
        env.prefault();
        let before = env.counts();
        let device = MockDevice::new(4096).completion(mode);
        let io = DirectIo::new(&env.mm, &env.space, &device);
        let (result, stats) = run(
            &device,
            io.direct_io_with_stats(Direction::Read, &gapped, &[buffer(32)], 0),
        );
        assert_eq!(result, Ok(32 * 4096), "{mode:?}");
        assert_eq!(stats.batches_submitted, 8, "{mode:?}");
        assert_eq!(stats.batches_reaped, 8, "{mode:?}");
        assert_eq!(env.counts(), before, "{mode:?}");
        env.assert_released();
    }
}

#[test]
fn mapping_error_drains_submitted_batches() {
    let env = Env::rw();
    env.prefault();
    let before = env.counts();
    let device = MockDevice::new(4096).completion(Completion::Reverse);
    let io = DirectIo::new(&env.mm, &env.space, &device);
    let failing = |block: u64, create: bool| -> KResult<BlockMapping> {
        if block == 20 {
            return Err(errno::EIO);
        }
        gapped(block, create)
    };
    let (result, stats) = run(
        &device,
        io.direct_io_with_stats(Direction::Read, &failing, &[buffer(32)], 0),
    );
    // 前 20 个块已经交给了 5 个批次
    assert_eq!(result, Ok(20 * 4096));
    assert_eq!(stats.batches_submitted, 5);
    assert_eq!(stats.batches_reaped, 5);
    assert_eq!(env.counts(), before);
    env.assert_released();

    let broken = |_: u64, _: bool| -> KResult<BlockMapping> { Err(errno::EIO) };
    assert_eq!(
        run(&device, io.direct_io(Direction::Read, &broken, buffer(32), 0)),
        Err(errno::EIO)
    );
    assert_eq!(device.submissions().len(), 5);
    env.assert_released();
}

#[test]
fn device_errors_shorten_the_transfer() {
    let cases = [
        (MockDevice::new(4096).fail(2, errno::EIO), Ok(8 * 4096)),
        (MockDevice::new(4096).fail(0, errno::EIO), Err(errno::EIO)),
        (
            MockDevice::new(4096)
                .completion(Completion::Shuffled(7))
                .fail(3, errno::EIO)
                .fail(1, errno::ENOMEM),
            Ok(4 * 4096),
        ),
        (
            MockDevice::new(4096)
                .completion(Completion::Reverse)
                .fail(7, errno::EIO),
            Ok(28 * 4096),
        ),
    ];
    for (device, expected) in cases {
        let env = Env::rw();
        let io = DirectIo::new(&env.mm, &env.space, &device);
        let (result, stats) = run(
            &device,
            io.direct_io_with_stats(Direction::Write, &gapped, &[buffer(32)], 0),
        );
        assert_eq!(result, expected);
        assert_eq!(stats.batches_reaped, stats.batches_submitted);
        env.assert_released();
    }
}

#[test]
fn reaper_drains_completions_while_submitting() {
    let env = Env::rw();
    let scattered = |block: u64, _: bool| -> KResult<BlockMapping> {
        Ok(BlockMapping::mapped(block * 2))
    };

    let device = MockDevice::new(4096);
    let io = DirectIo::new(&env.mm, &env.space, &device).with_config(DioConfig {
        reap_interval: 2,
        ..DioConfig::default()
    });
    let (result, stats) = run(
        &device,
        io.direct_io_with_stats(Direction::Read, &scattered, &[buffer(8)], 0),
    );
    assert_eq!(result, Ok(8 * 4096));
    assert_eq!(stats.batches_submitted, 8);
    assert_eq!(stats.reap_passes, 4);
    assert_eq!(stats.batches_reaped, 8);

    // 默认的间隔下，8 个批次全部留到最后等待
    let io = DirectIo::new(&env.mm, &env.space, &device);
    let (_, stats) = run(
        &device,
        io.direct_io_with_stats(Direction::Read, &scattered, &[buffer(8)], 0),
    );
    assert_eq!(stats.reap_passes, 0);
    assert_eq!(stats.batches_reaped, 8);
    env.assert_released();
}
