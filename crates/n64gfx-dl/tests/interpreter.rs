use std::time::Duration;

use n64gfx_core::backend::FillRect;
use n64gfx_core::cmd::{RenderCommand, TextureLoad, TexturedRect};
use n64gfx_core::combiner::CombinerFlags;
use n64gfx_core::format::PixelFormat;
use n64gfx_dl::gbi::*;
use n64gfx_dl::{
    CommandSink, Interpreter, InterpreterConfig, InterpreterError, ListOutcome, RdramView,
    RecordingSink, SinkError,
};
use n64gfx_ring::PoolError;
use pretty_assertions::assert_eq;

type Cmd = (u32, u32);

struct Ram(Vec<u8>);

impl Ram {
    fn new(len: usize) -> Self {
        Self(vec![0; len])
    }

    fn list(&mut self, addr: u32, cmds: &[Cmd]) {
        for (i, (w0, w1)) in cmds.iter().enumerate() {
            let at = addr as usize + i * 8;
            self.0[at..at + 4].copy_from_slice(&w0.to_be_bytes());
            self.0[at + 4..at + 8].copy_from_slice(&w1.to_be_bytes());
        }
    }

    fn vertices(&mut self, addr: u32, positions: &[[i16; 3]]) {
        for (i, p) in positions.iter().enumerate() {
            let at = addr as usize + i * 16;
            for (k, c) in p.iter().enumerate() {
                self.0[at + k * 2..at + k * 2 + 2].copy_from_slice(&c.to_be_bytes());
            }
            self.0[at + 12..at + 16].copy_from_slice(&[0xFF, 0x80, 0x40, 0xFF]);
        }
    }

    fn view(&self) -> RdramView<'_> {
        RdramView::new(&self.0).unwrap()
    }
}

fn op(code: u8) -> u32 {
    (code as u32) << 24
}

fn vtx(n: u32, v0: u32, addr: u32) -> Cmd {
    (op(G_VTX) | n << 12 | (v0 + n) << 1, addr)
}

fn tri1(a: u32, b: u32, c: u32) -> Cmd {
    (op(G_TRI1) | (a * 2) << 16 | (b * 2) << 8 | c * 2, 0)
}

fn call(addr: u32) -> Cmd {
    (op(G_DL), addr)
}

fn branch(addr: u32) -> Cmd {
    (op(G_DL) | 1 << 16, addr)
}

fn end() -> Cmd {
    (op(G_ENDDL), 0)
}

fn othermode_h(shift: u32, len: u32, value: u32) -> Cmd {
    (op(G_SETOTHERMODE_H) | (32 - shift - len) << 8 | (len - 1), value)
}

/// Visible counter-clockwise triangle at the center of the screen.
const TRIANGLE: [[i16; 3]; 3] = [[0, 0, 0], [1, 0, 0], [0, 1, 0]];

fn run(ram: &Ram, interp: &mut Interpreter, addr: u32) -> (ListOutcome, Vec<RenderCommand>) {
    let mut sink = RecordingSink::new();
    let outcome = interp.run(&ram.view(), addr, &mut sink);
    (outcome, sink.take())
}

fn draws(cmds: &[RenderCommand]) -> Vec<usize> {
    cmds.iter()
        .filter_map(|c| match c {
            RenderCommand::DrawTriangles(v) => Some(v.len()),
            _ => None,
        })
        .collect()
}

#[test]
fn call_returns_to_the_command_after_it() {
    let mut ram = Ram::new(0x1000);
    ram.vertices(0x800, &TRIANGLE);
    ram.list(0x100, &[vtx(3, 0, 0x800), call(0x200), tri1(0, 1, 2), end()]);
    ram.list(0x200, &[tri1(0, 1, 2), end()]);

    let mut interp = Interpreter::default();
    let (outcome, cmds) = run(&ram, &mut interp, 0x100);
    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(interp.stats().triangles, 2);
    assert_eq!(interp.stats().commands, 6);
    // Control flow does not split the batch.
    assert_eq!(draws(&cmds), vec![6]);
}

#[test]
fn branch_does_not_return() {
    let mut ram = Ram::new(0x1000);
    ram.vertices(0x800, &TRIANGLE);
    ram.list(0x100, &[vtx(3, 0, 0x800), branch(0x200), tri1(0, 1, 2), end()]);
    ram.list(0x200, &[tri1(0, 1, 2), end()]);

    let mut interp = Interpreter::default();
    let (outcome, _) = run(&ram, &mut interp, 0x100);
    assert!(outcome.is_completed());
    assert_eq!(interp.stats().triangles, 1);
}

#[test]
fn stack_overflow_aborts_only_that_list() {
    let mut ram = Ram::new(0x1000);
    ram.vertices(0x800, &TRIANGLE);
    ram.list(0x100, &[call(0x100)]);
    ram.list(0x300, &[vtx(3, 0, 0x800), tri1(0, 1, 2), end()]);

    let mut interp = Interpreter::default();
    let (outcome, _) = run(&ram, &mut interp, 0x100);
    match outcome {
        ListOutcome::Aborted(InterpreterError::StackOverflow { depth, address }) => {
            assert_eq!(depth, 18);
            assert_eq!(address, 0x100);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(interp.stats().stack_overflows, 1);

    let (outcome, cmds) = run(&ram, &mut interp, 0x300);
    assert!(outcome.is_completed());
    assert_eq!(draws(&cmds), vec![3]);
}

#[test]
fn runaway_lists_hit_the_command_budget() {
    let mut ram = Ram::new(0x1000);
    ram.list(0x100, &[(op(G_NOOP), 0), branch(0x100)]);

    let mut interp = Interpreter::new(InterpreterConfig {
        command_budget: 100,
        ..InterpreterConfig::default()
    });
    let (outcome, _) = run(&ram, &mut interp, 0x100);
    assert!(matches!(outcome, ListOutcome::CommandBudgetExhausted));
    assert_eq!(interp.stats().commands, 100);
}

#[test]
fn unknown_opcodes_are_skipped_and_counted() {
    let mut ram = Ram::new(0x1000);
    ram.vertices(0x800, &TRIANGLE);
    ram.list(
        0x100,
        &[(0x4200_0000, 0), (0x4200_0000, 0), vtx(3, 0, 0x800), tri1(0, 1, 2), end()],
    );

    let mut interp = Interpreter::default();
    let (outcome, cmds) = run(&ram, &mut interp, 0x100);
    assert!(outcome.is_completed());
    assert_eq!(interp.stats().unknown_opcodes, 2);
    assert_eq!(draws(&cmds), vec![3]);
}

#[test]
fn state_is_emitted_once_and_batches_split_on_state_changes() {
    let mut ram = Ram::new(0x1000);
    ram.vertices(0x800, &TRIANGLE);
    ram.list(
        0x100,
        &[
            vtx(3, 0, 0x800),
            tri1(0, 1, 2),
            tri1(0, 1, 2),
            (op(G_SETPRIMCOLOR), 0x1122_3344),
            tri1(0, 1, 2),
            end(),
        ],
    );

    let mut interp = Interpreter::default();
    let (_, cmds) = run(&ram, &mut interp, 0x100);
    let opcodes: Vec<_> = cmds.iter().map(|c| c.opcode().to_string()).collect();
    assert_eq!(
        opcodes,
        [
            "SetCombine",
            "SetOtherModes",
            "SetColors",
            "DrawTriangles",
            "SetColors",
            "DrawTriangles",
        ]
    );
    assert_eq!(draws(&cmds), vec![6, 3]);
    match &cmds[4] {
        RenderCommand::SetColors(colors) => assert_eq!(colors.prim, 0x1122_3344),
        other => panic!("expected colors, got {other:?}"),
    }
    match &cmds[0] {
        RenderCommand::SetCombine { flags, .. } => assert!(flags.is_empty()),
        other => panic!("expected combine, got {other:?}"),
    }
}

#[test]
fn full_batches_are_split_into_chunks() {
    let mut ram = Ram::new(0x1000);
    ram.vertices(0x800, &TRIANGLE);
    let mut cmds = vec![vtx(3, 0, 0x800)];
    cmds.extend(std::iter::repeat(tri1(0, 1, 2)).take(40));
    cmds.push(end());
    ram.list(0x100, &cmds);

    let mut interp = Interpreter::default();
    let (_, out) = run(&ram, &mut interp, 0x100);
    assert_eq!(draws(&out), vec![96, 24]);
    // State is not repeated for the second chunk.
    assert_eq!(out.len(), 5);
}

#[test]
fn lit_vertices_are_shaded_from_their_normals() {
    let mut ram = Ram::new(0x1000);
    ram.vertices(0x800, &TRIANGLE);
    for i in 0..3 {
        // Normal facing +z, alpha 0xFF.
        ram.0[0x800 + i * 16 + 12..0x800 + i * 16 + 16].copy_from_slice(&[0, 0, 127, 0xFF]);
    }
    // Red light shining along +z.
    ram.0[0x900..0x90C].copy_from_slice(&[255, 0, 0, 0, 255, 0, 0, 0, 0, 0, 127, 0]);
    ram.list(
        0x100,
        &[
            (op(G_GEOMETRYMODE) | 0x00FF_FFFF, GeometryMode::LIGHTING.bits()),
            (op(G_MOVEWORD) | G_MW_NUMLIGHT << 16, 24),
            // Light 0 sits after the two look-at slots.
            (op(G_MOVEMEM) | (48 / 8) << 8 | G_MV_LIGHT, 0x900),
            // Ambient follows the last directional light.
            (op(G_MOVEWORD) | G_MW_LIGHTCOL << 16 | 24, 0x2040_8000),
            vtx(3, 0, 0x800),
            tri1(0, 1, 2),
            (op(G_GEOMETRYMODE), 0),
            vtx(3, 0, 0x800),
            tri1(0, 1, 2),
            end(),
        ],
    );

    let mut interp = Interpreter::default();
    let (outcome, cmds) = run(&ram, &mut interp, 0x100);
    assert!(outcome.is_completed());
    let colors: Vec<[f32; 4]> = cmds
        .iter()
        .filter_map(|c| match c {
            RenderCommand::DrawTriangles(v) => Some(v.iter().map(|v| v.color).collect::<Vec<_>>()),
            _ => None,
        })
        .flatten()
        .collect();
    let rgba = |c: [u8; 4]| c.map(|c| c as f32 / 255.0);
    assert_eq!(colors.len(), 6);
    assert_eq!(colors[0], rgba([255, 64, 128, 255]));
    // With lighting off the normal bytes are taken as the color again.
    assert_eq!(colors[3], rgba([0, 0, 127, 255]));
}

#[test]
fn culled_and_offscreen_triangles_are_dropped() {
    let mut ram = Ram::new(0x1000);
    ram.vertices(0x800, &[[0, 0, 0], [0, 1, 0], [1, 0, 0], [2, 0, 0], [3, 0, 0], [2, 1, 0]]);
    ram.list(
        0x100,
        &[
            (op(G_GEOMETRYMODE) | 0x00FF_FFFF, GeometryMode::CULL_BACK.bits()),
            vtx(6, 0, 0x800),
            // Clockwise.
            tri1(0, 1, 2),
            // Entirely right of the screen.
            tri1(3, 4, 5),
            // Counter-clockwise survives.
            tri1(0, 2, 1),
            end(),
        ],
    );

    let mut interp = Interpreter::default();
    let (_, cmds) = run(&ram, &mut interp, 0x100);
    assert_eq!(interp.stats().dropped_triangles, 2);
    assert_eq!(interp.stats().triangles, 1);
    assert_eq!(draws(&cmds), vec![3]);
}

#[test]
fn segments_resolve_and_mask_their_base() {
    let mut ram = Ram::new(0x4000);
    ram.vertices(0x2800, &TRIANGLE);
    ram.list(
        0x100,
        &[
            (op(G_MOVEWORD) | G_MW_SEGMENT << 16 | 6 * 4, 0x8000_2000),
            vtx(3, 0, 0x0600_0800),
            call(0x0600_0100),
            end(),
        ],
    );
    ram.list(0x2100, &[tri1(0, 1, 2), end()]);

    let mut interp = Interpreter::default();
    let (outcome, cmds) = run(&ram, &mut interp, 0x100);
    assert!(outcome.is_completed());
    assert_eq!(interp.segments().base(6), 0x2000);
    assert_eq!(draws(&cmds), vec![3]);
}

#[test]
fn cull_dl_ends_the_list_when_its_volume_is_offscreen() {
    let mut ram = Ram::new(0x1000);
    ram.vertices(0x800, &[[5, 0, 0], [6, 1, 0], [5, 2, 0]]);
    ram.list(0x100, &[call(0x200), end()]);
    ram.list(
        0x200,
        &[vtx(3, 0, 0x800), (op(G_CULLDL), 2 * 2), tri1(0, 1, 2), end()],
    );

    let mut interp = Interpreter::default();
    let (outcome, cmds) = run(&ram, &mut interp, 0x100);
    assert!(outcome.is_completed());
    assert_eq!(interp.stats().culled_lists, 1);
    assert_eq!(interp.stats().triangles, 0);
    assert!(draws(&cmds).is_empty());
}

#[test]
fn fill_rects_use_the_16_bit_fill_color_and_inclusive_bounds() {
    let mut ram = Ram::new(0x1000);
    ram.list(
        0x100,
        &[
            othermode_h(G_MDSFT_CYCLETYPE, 2, G_CYC_FILL << G_MDSFT_CYCLETYPE),
            (op(G_SETCIMG) | 2 << 19 | (320 - 1), 0x0800),
            (op(G_SETFILLCOLOR), 0xF801_F801),
            (op(G_FILLRECT) | (19 << 2) << 12 | 9 << 2, (10 << 2) << 12),
            end(),
        ],
    );

    let mut interp = Interpreter::default();
    let (_, cmds) = run(&ram, &mut interp, 0x100);
    assert_eq!(
        cmds,
        vec![RenderCommand::FillRects(vec![FillRect {
            x0: 10,
            y0: 0,
            x1: 20,
            y1: 10,
            color: [255, 0, 0, 255],
        }])]
    );
}

/// Texture setup: 4x2 RGBA16 image at 0x1000 loaded by `G_LOADBLOCK` into
/// tile 0.
fn texture_setup(image: u32) -> Vec<Cmd> {
    vec![
        (op(G_SETCOMBINE) | 0x0012_1824, 0xFF33_FFFF),
        (op(G_TEXTURE) | 1 << 1, 0xFFFF_FFFF),
        (op(G_SETTIMG) | 2 << 19 | (4 - 1), image),
        (op(G_SETTILE) | 2 << 19 | 1 << 9, 0),
        load_block(),
        (op(G_SETTILESIZE), (3 << 2) << 12 | 1 << 2),
    ]
}

fn load_block() -> Cmd {
    (op(G_LOADBLOCK), (8 - 1) << 12)
}

fn texture_bytes() -> Vec<u8> {
    (0u8..16).map(|b| b.wrapping_mul(17)).collect()
}

#[test]
fn reloading_a_block_re_sends_the_texture() {
    let mut ram = Ram::new(0x2000);
    ram.0[0x1000..0x1010].copy_from_slice(&texture_bytes());
    ram.vertices(0x800, &TRIANGLE);
    let mut list = texture_setup(0x1000);
    list.extend([vtx(3, 0, 0x800), tri1(0, 1, 2), load_block(), tri1(0, 1, 2), end()]);
    ram.list(0x100, &list);

    let mut interp = Interpreter::default();
    let (outcome, cmds) = run(&ram, &mut interp, 0x100);
    assert!(outcome.is_completed());

    let loads: Vec<_> = cmds
        .iter()
        .filter_map(|c| match c {
            RenderCommand::LoadTexture(load) => Some(load),
            _ => None,
        })
        .collect();
    assert_eq!(loads.len(), 2);
    for load in loads {
        assert_eq!(load.slot, 0);
        assert_eq!(load.address, 0x1000);
        // Two 8-byte rows one 64-bit word apart.
        assert_eq!(load.source_len, 16);
        assert_eq!(load.format, PixelFormat::Rgba5551);
        assert_eq!((load.width, load.height), (4, 2));
        assert_eq!(load.bytes, texture_bytes());
        assert_eq!(load.palette, None);
    }
    assert_eq!(draws(&cmds), vec![3, 3]);
    match &cmds[0] {
        RenderCommand::SetCombine { mux, flags } => {
            assert_eq!(*mux, 0x0012_1824_FF33_FFFF);
            assert_eq!(*flags, CombinerFlags::TEXTURE_PRESENT);
        }
        other => panic!("expected combine, got {other:?}"),
    }
}

fn loaded_textures(cmds: &[RenderCommand]) -> Vec<&TextureLoad> {
    cmds.iter()
        .filter_map(|c| match c {
            RenderCommand::LoadTexture(load) => Some(load),
            _ => None,
        })
        .collect()
}

#[test]
fn tile_loads_span_every_strided_row() {
    let mut ram = Ram::new(0x2000);
    for row in 0..4usize {
        let at = 0x1000 + row * 128;
        ram.0[at..at + 16].fill(row as u8 + 1);
    }
    ram.vertices(0x800, &TRIANGLE);
    ram.list(
        0x100,
        &[
            (op(G_SETCOMBINE) | 0x0012_1824, 0xFF33_FFFF),
            (op(G_TEXTURE) | 1 << 1, 0xFFFF_FFFF),
            // 64 texels wide, so rows are 128 bytes apart.
            (op(G_SETTIMG) | 2 << 19 | (64 - 1), 0x1000),
            (op(G_SETTILE) | 2 << 19 | 2 << 9, 0),
            (op(G_LOADTILE), (7 << 2) << 12 | 3 << 2),
            vtx(3, 0, 0x800),
            tri1(0, 1, 2),
            end(),
        ],
    );

    let mut interp = Interpreter::default();
    let (outcome, cmds) = run(&ram, &mut interp, 0x100);
    assert!(outcome.is_completed());
    let loads = loaded_textures(&cmds);
    assert_eq!(loads.len(), 1);
    let load = loads[0];
    assert_eq!((load.width, load.height), (8, 4));
    assert_eq!(load.address, 0x1000);
    assert_eq!(load.source_len, 3 * 128 + 16);
    assert_eq!(&load.bytes[48..], &[4; 16]);
}

#[test]
fn block_loads_with_a_line_stride_span_every_row() {
    let mut ram = Ram::new(0x2000);
    ram.vertices(0x800, &TRIANGLE);
    let mut list = texture_setup(0x1000);
    // Two words per row instead of one.
    list[3] = (op(G_SETTILE) | 2 << 19 | 2 << 9, 0);
    list.extend([vtx(3, 0, 0x800), tri1(0, 1, 2), end()]);
    ram.list(0x100, &list);

    let mut interp = Interpreter::default();
    let (_, cmds) = run(&ram, &mut interp, 0x100);
    let loads = loaded_textures(&cmds);
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].bytes.len(), 16);
    assert_eq!(loads[0].source_len, 16 + 8);
}

#[test]
fn texture_rects_read_coordinates_from_rdp_halves() {
    let mut ram = Ram::new(0x2000);
    ram.0[0x1000..0x1010].copy_from_slice(&texture_bytes());
    let mut list = texture_setup(0x1000);
    list.extend([
        (op(G_TEXRECT) | (20 << 2) << 12 | 20 << 2, (10 << 2) << 12 | 10 << 2),
        (op(G_RDPHALF_1), 0),
        (op(G_RDPHALF_2), (1 << 10) << 16 | 1 << 10),
        end(),
    ]);
    ram.list(0x100, &list);

    let mut interp = Interpreter::default();
    let (outcome, cmds) = run(&ram, &mut interp, 0x100);
    assert!(outcome.is_completed());
    let rects: Vec<_> = cmds
        .iter()
        .filter_map(|c| match c {
            RenderCommand::DrawRects(r) => Some(r.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        rects,
        vec![vec![TexturedRect {
            x0: 10.0,
            y0: 10.0,
            x1: 20.0,
            y1: 20.0,
            s0: 0.0,
            t0: 0.0,
            s1: 2.5,
            t1: 5.0,
        }]]
    );
}

#[test]
fn sampling_a_recent_color_image_captures_it() {
    let mut ram = Ram::new(0x20_0000);
    ram.vertices(0x800, &TRIANGLE);
    let cimg = 0x10_0000;
    let texel = cimg + (10 * 320 + 4) * 2;
    let mut list = vec![(op(G_SETCIMG) | 2 << 19 | (320 - 1), cimg)];
    list.extend(texture_setup(texel));
    list.extend([vtx(3, 0, 0x800), tri1(0, 1, 2), end()]);
    ram.list(0x100, &list);

    let mut interp = Interpreter::default();
    let (_, cmds) = run(&ram, &mut interp, 0x100);
    let capture = cmds
        .iter()
        .find_map(|c| match c {
            RenderCommand::CaptureColorBuffer(capture) => Some(*capture),
            _ => None,
        })
        .expect("capture command");
    assert_eq!(capture.address, texel);
    assert_eq!((capture.params.x0, capture.params.y0), (4, 10));
    assert_eq!((capture.params.width, capture.params.height), (4, 2));
    assert_eq!(capture.params.bit_depth, 16);
    assert!(capture.params.synchronous);
    assert!(!cmds.iter().any(|c| matches!(c, RenderCommand::LoadTexture(_))));
}

#[test]
fn host_writes_are_invalidated_before_texture_state_changes() {
    let mut ram = Ram::new(0x2000);
    ram.list(0x100, &[(op(G_SETTIMG) | 2 << 19 | 3, 0x1000), end()]);

    let mut interp = Interpreter::default();
    interp.notify_ram_write(0x1000, 16);
    let (_, cmds) = run(&ram, &mut interp, 0x100);
    assert_eq!(
        cmds,
        vec![RenderCommand::InvalidateRange {
            address: 0x1000,
            len: 16
        }]
    );

    let mut sink = RecordingSink::new();
    interp.end_frame(&mut sink).unwrap();
    assert_eq!(sink.commands, vec![RenderCommand::EndFrame]);
}

/// Fails the first `failures` submissions with `error`.
struct FlakySink {
    failures: usize,
    error: PoolError,
    inner: RecordingSink,
}

impl CommandSink for FlakySink {
    fn submit(&mut self, cmd: &RenderCommand) -> Result<(), SinkError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(self.error.into());
        }
        self.inner.submit(cmd)
    }
}

#[test]
fn dropped_commands_cause_state_to_be_resent() {
    let mut ram = Ram::new(0x1000);
    ram.vertices(0x800, &TRIANGLE);
    ram.list(
        0x100,
        &[
            vtx(3, 0, 0x800),
            tri1(0, 1, 2),
            (op(G_SETENVCOLOR), 1),
            tri1(0, 1, 2),
            end(),
        ],
    );

    let mut sink = FlakySink {
        failures: 1,
        error: PoolError::Timeout(Duration::from_millis(1)),
        inner: RecordingSink::new(),
    };
    let mut interp = Interpreter::default();
    let outcome = interp.run(&ram.view(), 0x100, &mut sink);
    assert!(outcome.is_completed());
    assert_eq!(interp.stats().sink_errors, 1);

    // The first SetCombine was lost, so it comes again with the second batch.
    let combines = sink
        .inner
        .commands
        .iter()
        .filter(|c| matches!(c, RenderCommand::SetCombine { .. }))
        .count();
    assert_eq!(combines, 1);
    assert_eq!(draws(&sink.inner.commands), vec![3, 3]);
}

#[test]
fn a_closed_sink_aborts_the_list() {
    let mut ram = Ram::new(0x1000);
    ram.vertices(0x800, &TRIANGLE);
    ram.list(0x100, &[vtx(3, 0, 0x800), tri1(0, 1, 2), end()]);

    let mut sink = FlakySink {
        failures: usize::MAX,
        error: PoolError::Closed,
        inner: RecordingSink::new(),
    };
    let mut interp = Interpreter::default();
    let outcome = interp.run(&ram.view(), 0x100, &mut sink);
    assert!(matches!(
        outcome,
        ListOutcome::Aborted(InterpreterError::Sink(_))
    ));
    assert_eq!(interp.stats().sink_errors, 1);
}
