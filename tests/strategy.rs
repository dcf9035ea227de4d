mod common;

use std::sync::Arc;
use common::{png_bytes, primary, quant, threaded, with_avif, with_palette, with_pngx, with_webp, Encode, MockImage, MockLoader};
use codec_bridge_lib::core::{FormatOptions, OptionRecord};
use codec_bridge_lib::processing::native::NativeValue;
use codec_bridge_lib::{convert, BridgeError, CodecContext, OutputFormat, WorkerConfig};

const INPUT_LEN: usize = 4000;
const QUANTIZE: &str = "pngx_bridge_quantize";
const CLEANUP: &str = "emscripten_pngx_palette256_cleanup";
const FINALIZE: &str = "emscripten_pngx_palette256_finalize";

fn context(codec: &Arc<MockImage>, secondary: Option<&Arc<MockImage>>, threads: Option<usize>) -> CodecContext {
    let mut loader = MockLoader::new().with("codec.wasm", Arc::clone(codec));
    let mut config = WorkerConfig::new("codec.wasm");
    if let Some(secondary) = secondary {
        loader = loader.with("quant.wasm", Arc::clone(secondary));
        config = config.with_secondary("quant.wasm");
    }
    config.thread_count = threads;
    CodecContext::init(&loader, &config).unwrap()
}

fn pngx(record: OptionRecord) -> FormatOptions {
    FormatOptions::from_record(OutputFormat::Pngx, &record)
}

fn palette_codec(quality_min: u8, finalized_len: usize) -> Arc<MockImage> {
    with_palette(primary(), 16, 16, quality_min, finalized_len).build()
}

fn assert_balanced(image: &MockImage) {
    image.with(|state| {
        assert!(state.live.is_empty(), "leaked allocations: {:?}", state.live);
        assert_eq!(state.bad_releases, 0);
    });
}

fn quality_min_args(image: &MockImage) -> Vec<i32> {
    image.with(|state| state.calls_to(QUANTIZE).iter().map(|args| common::int(args, 5)).collect())
}

#[test]
fn webp_happy_path_is_smaller_than_input() {
    let codec = with_webp(primary(), |len| Encode::Output(len / 3)).build();
    let mut ctx = context(&codec, None, None);
    let input = png_bytes(64 * 64 * 4 + 100);

    let options = FormatOptions::from_record(OutputFormat::WebP, &OptionRecord::new().with("quality", 75));
    let output = convert(&mut ctx, &options, &input).unwrap();

    assert!(output.len() < input.len());
    assert_balanced(&codec);
}

#[test]
fn incompressible_avif_reports_both_sizes() {
    let codec = with_avif(primary(), |len| Encode::Output(len + 64)).build();
    let mut ctx = context(&codec, None, None);

    let options = FormatOptions::from_record(OutputFormat::Avif, &OptionRecord::new());
    let err = convert(&mut ctx, &options, &png_bytes(INPUT_LEN)).unwrap_err();

    match err {
        BridgeError::OutputLargerThanInput { format, input_size, output_size } => {
            assert_eq!(format, "AVIF");
            assert_eq!(input_size, INPUT_LEN);
            assert_eq!(output_size, Some(INPUT_LEN + 64));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn lossless_pngx_returns_smaller_output_or_the_input_itself() {
    let codec = palette_codec(0, 100);
    let shrinking = quant(vec![], |len| len - 10).build();
    let mut ctx = context(&codec, Some(&shrinking), None);
    let options = pngx(OptionRecord::new().with("pngx_lossy_enable", false));
    let input = png_bytes(INPUT_LEN);

    let output = convert(&mut ctx, &options, &input).unwrap();
    assert_eq!(output.len(), INPUT_LEN - 10);

    let growing = quant(vec![], |len| len + 10).build();
    let mut ctx = context(&codec, Some(&growing), None);
    let output = convert(&mut ctx, &options, &input).unwrap();
    assert_eq!(output, input);
    assert_balanced(&growing);
    codec.with(|state| assert_eq!(state.call_count("emscripten_pngx_palette256_prepare"), 0));
}

#[test]
fn palette_quality_miss_retries_once_without_a_floor() {
    let codec = palette_codec(40, 1000);
    let secondary = quant(vec![1, 0], |len| len - 100).build();
    let mut ctx = context(&codec, Some(&secondary), None);

    let output = convert(&mut ctx, &pngx(OptionRecord::new()), &png_bytes(INPUT_LEN)).unwrap();

    assert_eq!(output.len(), 900);
    assert_eq!(quality_min_args(&secondary), vec![40, 0]);
    codec.with(|state| {
        assert_eq!(state.call_count(FINALIZE), 1);
        assert_eq!(state.call_count(CLEANUP), 1);
    });
    assert_balanced(&codec);
    assert_balanced(&secondary);
}

#[test]
fn palette_quality_miss_without_a_floor_is_not_retried() {
    let codec = palette_codec(0, 1000);
    let secondary = quant(vec![1], |len| len / 2).build();
    let mut ctx = context(&codec, Some(&secondary), None);

    let output = convert(&mut ctx, &pngx(OptionRecord::new()), &png_bytes(INPUT_LEN)).unwrap();

    assert_eq!(output.len(), INPUT_LEN / 2);
    assert_eq!(quality_min_args(&secondary), vec![0]);
}

#[test]
fn palette_that_never_succeeds_falls_back_to_lossless() {
    let codec = palette_codec(40, 1000);
    let secondary = quant(vec![1, 1], |len| len / 2).build();
    let mut ctx = context(&codec, Some(&secondary), None);

    let output = convert(&mut ctx, &pngx(OptionRecord::new()), &png_bytes(INPUT_LEN)).unwrap();

    assert_eq!(output.len(), INPUT_LEN / 2);
    assert!(output.iter().all(|b| *b == 0x33));
    codec.with(|state| {
        assert_eq!(state.call_count(FINALIZE), 0);
        assert_eq!(state.call_count(CLEANUP), 1);
    });
    assert_balanced(&codec);
    assert_balanced(&secondary);
}

#[test]
fn palette_failing_every_fallback_reports_the_candidate_size() {
    let codec = palette_codec(0, 5000);
    let secondary = quant(vec![0], |len| len + 1).build();
    let mut ctx = context(&codec, Some(&secondary), None);

    let err = convert(&mut ctx, &pngx(OptionRecord::new()), &png_bytes(INPUT_LEN)).unwrap_err();

    match err {
        BridgeError::OutputLargerThanInput { format, input_size, output_size } => {
            assert_eq!(format, "PNGX");
            assert_eq!(input_size, INPUT_LEN);
            assert_eq!(output_size, Some(5000));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_balanced(&codec);
}

#[test]
fn palette_larger_than_input_uses_lossless_original_when_smaller() {
    let codec = palette_codec(0, 5000);
    let secondary = quant(vec![0], |len| if len == INPUT_LEN { 3000 } else { len + 1 }).build();
    let mut ctx = context(&codec, Some(&secondary), None);

    let output = convert(&mut ctx, &pngx(OptionRecord::new()), &png_bytes(INPUT_LEN)).unwrap();

    assert_eq!(output.len(), 3000);
}

#[test]
fn failed_prepare_falls_back_and_cleans_up() {
    let codec = with_palette(primary(), 16, 16, 0, 1000)
        .export("emscripten_pngx_palette256_prepare", |state, _| {
            state.last_error = 6;
            Ok(Some(NativeValue::I32(0)))
        })
        .build();
    let secondary = quant(vec![], |len| len - 1).build();
    let mut ctx = context(&codec, Some(&secondary), None);

    let output = convert(&mut ctx, &pngx(OptionRecord::new()), &png_bytes(INPUT_LEN)).unwrap();

    assert_eq!(output.len(), INPUT_LEN - 1);
    codec.with(|state| assert_eq!(state.call_count(CLEANUP), 1));
    secondary.with(|state| assert_eq!(state.call_count(QUANTIZE), 0));
    assert_balanced(&codec);
}

#[test]
fn failed_finalize_releases_the_session_once_and_falls_back() {
    let codec = with_palette(primary(), 16, 16, 0, 1000)
        .export(FINALIZE, |state, _| {
            state.last_error = 5;
            Ok(Some(NativeValue::I32(0)))
        })
        .build();
    let secondary = quant(vec![0], |len| len - 7).build();
    let mut ctx = context(&codec, Some(&secondary), None);

    let output = convert(&mut ctx, &pngx(OptionRecord::new()), &png_bytes(INPUT_LEN)).unwrap();

    assert_eq!(output.len(), INPUT_LEN - 7);
    codec.with(|state| {
        assert_eq!(state.call_count(FINALIZE), 1);
        assert_eq!(state.call_count(CLEANUP), 1);
    });
    assert_balanced(&codec);
    assert_balanced(&secondary);
}

#[test]
fn failed_quantization_releases_the_session_once_and_falls_back() {
    let codec = palette_codec(0, 1000);
    let secondary = quant(vec![], |len| len + 7)
        .export(QUANTIZE, |_, _| Ok(Some(NativeValue::I32(0))))
        .build();
    let mut ctx = context(&codec, Some(&secondary), None);
    let input = png_bytes(INPUT_LEN);

    let output = convert(&mut ctx, &pngx(OptionRecord::new()), &input).unwrap();

    assert_eq!(output, input);
    codec.with(|state| {
        assert_eq!(state.call_count(FINALIZE), 0);
        assert_eq!(state.call_count(CLEANUP), 1);
    });
    secondary.with(|state| assert_eq!(state.call_count(QUANTIZE), 1));
    assert_balanced(&codec);
    assert_balanced(&secondary);
}

#[test]
fn missing_palette_export_is_not_masked_by_fallbacks() {
    let codec = with_palette(primary(), 16, 16, 0, 1000)
        .without("emscripten_pngx_palette256_prepare")
        .build();
    let secondary = quant(vec![], |len| len / 2).build();
    let mut ctx = context(&codec, Some(&secondary), None);

    let err = convert(&mut ctx, &pngx(OptionRecord::new()), &png_bytes(INPUT_LEN)).unwrap_err();

    assert!(matches!(err, BridgeError::ModuleUnavailable { .. }));
    secondary.with(|state| assert_eq!(state.call_count("pngx_bridge_optimize_lossless"), 0));
}

#[test]
fn limited_mode_trusts_the_native_size_check() {
    let codec = with_pngx(primary(), |len| Encode::Output(len + 5)).build();
    let secondary = quant(vec![], |len| len).build();
    let mut ctx = context(&codec, Some(&secondary), None);

    let options = pngx(OptionRecord::new().with("pngx_lossy_type", 1));
    let output = convert(&mut ctx, &options, &png_bytes(INPUT_LEN)).unwrap();

    assert_eq!(output.len(), INPUT_LEN + 5);
    secondary.with(|state| assert_eq!(state.call_count(QUANTIZE), 0));
}

#[test]
fn pngx_without_quantization_module_uses_one_native_call() {
    let codec = with_pngx(primary(), |len| Encode::Output(len + 5)).build();
    let mut ctx = context(&codec, None, None);

    let err = convert(&mut ctx, &pngx(OptionRecord::new()), &png_bytes(INPUT_LEN)).unwrap_err();
    assert!(matches!(err, BridgeError::OutputLargerThanInput { .. }));

    let reduced = pngx(OptionRecord::new().with("pngx_lossy_type", 2));
    let output = convert(&mut ctx, &reduced, &png_bytes(INPUT_LEN)).unwrap();
    assert_eq!(output.len(), INPUT_LEN + 5);
    codec.with(|state| assert_eq!(state.call_count("emscripten_convert_png_to_pngx"), 2));
}

#[test]
fn thread_pool_failure_degrades_to_single_threaded() {
    let codec = palette_codec(0, 1000);
    let secondary = threaded(quant(vec![], |len| len - 100)).instance_limit(1).build();
    let mut ctx = context(&codec, Some(&secondary), Some(2));

    let info = ctx.info();
    assert!(info.secondary_enabled);
    assert!(!info.secondary_threads_enabled);
    secondary.with(|state| {
        assert_eq!(state.call_count("pngx_bridge_thread_pool_prepare"), 1);
        assert_eq!(state.call_count("pngx_bridge_thread_pool_shutdown"), 1);
    });

    let output = convert(&mut ctx, &pngx(OptionRecord::new()), &png_bytes(INPUT_LEN)).unwrap();
    assert_eq!(output.len(), 900);
}

#[test]
fn thread_pool_starts_workers_and_shuts_down_with_the_context() {
    let codec = palette_codec(0, 1000);
    let secondary = threaded(quant(vec![], |len| len - 100)).build();
    let ctx = context(&codec, Some(&secondary), Some(2));

    assert!(ctx.info().secondary_threads_enabled);
    assert_eq!(secondary.instances(), 3);

    drop(ctx);
    secondary.with(|state| {
        assert_eq!(state.call_count("pngx_bridge_thread_pool_shutdown"), 1);
        assert!(state.live.is_empty());
    });
}

#[test]
fn init_collects_versions_and_prewarms_threads() {
    let codec = primary()
        .constant("emscripten_is_threads_enabled", 1)
        .constant("emscripten_get_max_thread_count", 2)
        .export("emscripten_prewarm_thread_pool", |_, _| Ok(None))
        .build();
    let secondary = quant(vec![], |len| len).build();
    let ctx = context(&codec, Some(&secondary), Some(8));

    let info = ctx.info();
    assert!(info.threads_enabled);
    assert!(!info.secondary_threads_enabled);
    assert_eq!(info.versions.version, Some(1_006_002));
    assert_eq!(info.versions.pngx_oxipng_version, Some(90_100));
    assert_eq!(info.versions.libavif_version, None);
    codec.with(|state| {
        let prewarm = state.calls_to("emscripten_prewarm_thread_pool");
        assert_eq!(prewarm.len(), 1);
        assert_eq!(common::int(&prewarm[0], 0), 2);
    });
}

#[test]
fn failed_thread_count_queries_do_not_fail_init() {
    let codec = primary()
        .constant("emscripten_is_threads_enabled", 1)
        .export("emscripten_get_default_thread_count", |_, _| Err(BridgeError::fault("query trapped")))
        .export("emscripten_get_max_thread_count", |_, _| Err(BridgeError::fault("query trapped")))
        .export("emscripten_prewarm_thread_pool", |_, _| Ok(None))
        .build();
    let ctx = context(&codec, None, Some(3));

    assert!(ctx.info().threads_enabled);
    codec.with(|state| {
        let prewarm = state.calls_to("emscripten_prewarm_thread_pool");
        assert_eq!(prewarm.len(), 1);
        assert_eq!(common::int(&prewarm[0], 0), 3);
    });
}

#[test]
fn missing_quantization_exports_fail_init() {
    let codec = primary().build();
    let broken = quant(vec![], |len| len).without("pngx_bridge_quantize").build();
    let loader = MockLoader::new().with("codec.wasm", codec).with("quant.wasm", broken);

    let result = CodecContext::init(&loader, &WorkerConfig::new("codec.wasm").with_secondary("quant.wasm"));

    assert!(matches!(result, Err(BridgeError::Initialization(_))));
}
