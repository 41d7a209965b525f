use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use n64gfx::{Frame, GfxConfig, InterpreterError, ListOutcome, Session, SessionError};
use n64gfx_dl::gbi::*;
use pretty_assertions::assert_eq;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn session() -> (Session, Receiver<Frame>) {
    init_tracing();
    let (tx, rx) = mpsc::channel();
    let sink = Box::new(move |frame: Frame| {
        let _ = tx.send(frame);
    });
    let config = GfxConfig {
        screen_width: 32,
        screen_height: 16,
        ..GfxConfig::default()
    };
    (Session::new(config, sink).unwrap(), rx)
}

struct Ram(Vec<u8>);

impl Ram {
    fn new() -> Self {
        Self(vec![0; 0x1_0000])
    }

    fn list(&mut self, addr: usize, cmds: &[(u32, u32)]) {
        for (i, (w0, w1)) in cmds.iter().enumerate() {
            let at = addr + i * 8;
            self.0[at..at + 4].copy_from_slice(&w0.to_be_bytes());
            self.0[at + 4..at + 8].copy_from_slice(&w1.to_be_bytes());
        }
    }
}

fn op(code: u8) -> u32 {
    (code as u32) << 24
}

const END: (u32, u32) = (0xDF00_0000, 0);

fn fill_mode() -> (u32, u32) {
    let (shift, len) = (G_MDSFT_CYCLETYPE, 2);
    (
        op(G_SETOTHERMODE_H) | (32 - shift - len) << 8 | (len - 1),
        G_CYC_FILL << shift,
    )
}

#[test]
fn fill_rect_reaches_the_presented_frame() {
    let (mut session, frames) = session();
    let mut ram = Ram::new();
    ram.list(
        0x100,
        &[
            fill_mode(),
            (op(G_SETCIMG) | 3 << 19 | (32 - 1), 0x8000),
            (op(G_SETFILLCOLOR), 0x1020_30FF),
            (op(G_FILLRECT) | (7 << 2) << 12 | 3 << 2, 0),
            END,
        ],
    );

    let outcome = session.run_display_list(&ram.0, 0x100).unwrap();
    assert!(outcome.is_completed());
    session.end_frame().unwrap();

    let frame = frames.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!((frame.width, frame.height), (32, 16));
    assert_eq!(&frame.pixels[..4], &[0x10, 0x20, 0x30, 0xFF]);
    // Right of the inclusive 8-pixel-wide rectangle.
    assert_eq!(&frame.pixels[8 * 4..8 * 4 + 4], &[0, 0, 0, 0]);

    let stats = session.stats();
    assert_eq!(stats.frames, 1);
    assert_eq!(stats.draws, 1);
    assert_eq!(stats.commands, 5);
}

#[test]
fn identical_texture_loads_hit_the_cache() {
    let (mut session, _frames) = session();
    let mut ram = Ram::new();
    for (i, b) in ram.0[0x1000..0x1010].iter_mut().enumerate() {
        *b = i as u8 * 16;
    }
    // Vertices: a small triangle at the center of the screen.
    for (i, [x, y]) in [[0i16, 0], [1, 0], [0, 1]].into_iter().enumerate() {
        let at = 0x800 + i * 16;
        ram.0[at..at + 2].copy_from_slice(&x.to_be_bytes());
        ram.0[at + 2..at + 4].copy_from_slice(&y.to_be_bytes());
        ram.0[at + 12..at + 16].copy_from_slice(&[0xFF; 4]);
    }
    let load_block = (op(G_LOADBLOCK), (8 - 1) << 12);
    let tri = (op(G_TRI1) | 2 << 8 | 4, 0);
    ram.list(
        0x100,
        &[
            (op(G_SETCOMBINE) | 0x0012_1824, 0xFF33_FFFF),
            (op(G_TEXTURE) | 1 << 1, 0xFFFF_FFFF),
            (op(G_SETTIMG) | 2 << 19 | (4 - 1), 0x1000),
            (op(G_SETTILE) | 2 << 19 | 1 << 9, 0),
            load_block,
            (op(G_SETTILESIZE), (3 << 2) << 12 | 1 << 2),
            (op(G_VTX) | 3 << 12 | 3 << 1, 0x800),
            tri,
            load_block,
            tri,
            END,
        ],
    );

    assert!(session.run_display_list(&ram.0, 0x100).unwrap().is_completed());
    session.end_frame().unwrap();

    let stats = session.stats();
    assert_eq!(stats.texture_misses, 1);
    assert_eq!(stats.texture_hits, 1);
    assert_eq!(stats.draws, 2);
    assert_eq!(stats.combiner_builds, 1);
    assert_eq!(stats.decode_errors, 0);
}

#[test]
fn writes_to_any_sampled_row_drop_the_cached_texture() {
    let (mut session, _frames) = session();
    let mut ram = Ram::new();
    for (i, b) in ram.0[0x1000..0x1200].iter_mut().enumerate() {
        *b = i as u8;
    }
    for (i, [x, y]) in [[0i16, 0], [1, 0], [0, 1]].into_iter().enumerate() {
        let at = 0x800 + i * 16;
        ram.0[at..at + 2].copy_from_slice(&x.to_be_bytes());
        ram.0[at + 2..at + 4].copy_from_slice(&y.to_be_bytes());
        ram.0[at + 12..at + 16].copy_from_slice(&[0xFF; 4]);
    }
    // An 8x4 tile out of a 64-texel-wide RGBA16 image.
    ram.list(
        0x100,
        &[
            (op(G_SETCOMBINE) | 0x0012_1824, 0xFF33_FFFF),
            (op(G_TEXTURE) | 1 << 1, 0xFFFF_FFFF),
            (op(G_SETTIMG) | 2 << 19 | (64 - 1), 0x1000),
            (op(G_SETTILE) | 2 << 19 | 2 << 9, 0),
            (op(G_LOADTILE), (7 << 2) << 12 | 3 << 2),
            (op(G_VTX) | 3 << 12 | 3 << 1, 0x800),
            (op(G_TRI1) | 2 << 8 | 4, 0),
            END,
        ],
    );

    assert!(session.run_display_list(&ram.0, 0x100).unwrap().is_completed());
    session.end_frame().unwrap();

    // Row 4 is outside the tile.
    session.notify_ram_write(0x1000 + 4 * 128, 16);
    assert!(session.run_display_list(&ram.0, 0x100).unwrap().is_completed());
    session.end_frame().unwrap();
    assert_eq!(session.stats().texture_hits, 1);

    // Row 3 is the last one sampled.
    session.notify_ram_write(0x1000 + 3 * 128, 16);
    assert!(session.run_display_list(&ram.0, 0x100).unwrap().is_completed());
    session.end_frame().unwrap();

    let stats = session.stats();
    assert_eq!(stats.texture_misses, 2);
    assert_eq!(stats.texture_hits, 1);
}

#[test]
fn an_aborted_list_does_not_affect_the_next_one() {
    let (mut session, _frames) = session();
    let mut ram = Ram::new();
    ram.list(0x100, &[(op(G_DL), 0x100)]);
    ram.list(0x200, &[(op(G_SPNOOP), 0), END]);

    match session.run_display_list(&ram.0, 0x100).unwrap() {
        ListOutcome::Aborted(InterpreterError::StackOverflow { .. }) => {}
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(session.run_display_list(&ram.0, 0x200).unwrap().is_completed());
    assert_eq!(session.stats().stack_overflows, 1);
}

#[test]
fn ram_must_be_a_power_of_two() {
    let (mut session, _frames) = session();
    let ram = vec![0u8; 3000];
    assert!(matches!(
        session.run_display_list(&ram, 0),
        Err(SessionError::Memory(_))
    ));
}

#[test]
fn invalid_configuration_is_rejected_at_startup() {
    let config = GfxConfig {
        ring_buffer_bytes: 64,
        ..GfxConfig::default()
    };
    let result = Session::new(config, Box::new(|_: Frame| {}));
    assert!(matches!(result, Err(SessionError::Config(_))));
}
