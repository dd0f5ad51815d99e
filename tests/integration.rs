//! Integration tests for runbox.
//!
//! End-to-end boxed execution: staging, every sink type, limits and stdin.

use runbox::boxed::{BoxedCommand, BoxedExecutor, InputFile, OutputFile};
use runbox::config::types::ExecutionConfig;
use runbox::wrap::WrapperChain;
use runbox::{Command, UnboxedExecutor};

fn executor() -> BoxedExecutor {
    // No wrappers: sandbox tools are not assumed to exist on the test host.
    BoxedExecutor::with_chain(ExecutionConfig::default(), WrapperChain::new())
}

#[tokio::test]
async fn stdin_echo_with_limits_set() {
    let command = Command::new()
        .arg("cat")
        .cpu_time_limit(5)
        .memory_limit_kb(0)
        .stdin_bytes("hello");

    let result = UnboxedExecutor::new().execute(&command).await.unwrap();
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "hello");
}

#[tokio::test]
async fn string_to_string_round_trip() {
    let boxed = BoxedCommand::new("copy", Command::new().unsafe_append("cp in.txt out.txt"))
        .unwrap()
        .input_bytes("in.txt", "abc")
        .unwrap()
        .output_capture("out.txt")
        .unwrap();

    let result = executor().execute(boxed).await.unwrap();
    assert_eq!(result.exit_code, Some(0));
    assert!(result.was_received("out.txt"));
    assert_eq!(result.file_contents_str("out.txt").unwrap(), "abc");
}

#[tokio::test]
async fn every_sink_type_reproduces_the_bytes() {
    let payload: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
    let scratch = tempfile::tempdir().unwrap();

    // Inputs arrive from bytes, a local file and a stream; outputs leave
    // through capture, a local file and a stream.
    let input_path = scratch.path().join("input-on-disk.bin");
    std::fs::write(&input_path, &payload).unwrap();
    let stream_source = tokio::fs::File::open(&input_path).await.unwrap();

    let file_dest = scratch.path().join("file-sink.bin");
    let stream_dest_path = scratch.path().join("stream-sink.bin");
    let stream_dest = tokio::fs::File::create(&stream_dest_path).await.unwrap();

    let boxed = BoxedCommand::new(
        "fanout",
        Command::new().unsafe_append("cat in_a.bin in_b.bin in_c.bin > all.bin; cp all.bin to_file.bin; cp all.bin to_stream.bin"),
    )
    .unwrap()
    .input_bytes("in_a.bin", payload.clone())
    .unwrap()
    .input("in_b.bin", InputFile::LocalFile(input_path.clone()))
    .unwrap()
    .input("in_c.bin", InputFile::Stream(Box::new(stream_source)))
    .unwrap()
    .output_capture("all.bin")
    .unwrap()
    .output("to_file.bin", OutputFile::to_local_file(&file_dest))
    .unwrap()
    .output("to_stream.bin", OutputFile::to_stream(Box::new(stream_dest)))
    .unwrap();

    let result = executor().execute(boxed).await.unwrap();
    assert_eq!(result.exit_code, Some(0));

    let expected: Vec<u8> = payload
        .iter()
        .chain(payload.iter())
        .chain(payload.iter())
        .copied()
        .collect();
    assert_eq!(result.file_contents("all.bin").unwrap(), &expected[..]);
    assert_eq!(std::fs::read(&file_dest).unwrap(), expected);
    assert_eq!(std::fs::read(&stream_dest_path).unwrap(), expected);
}

#[tokio::test]
async fn outputs_survive_failure_exit_codes() {
    // A command may write its output and still exit non-zero; ungated
    // outputs are harvested either way.
    let boxed = BoxedCommand::new(
        "partial",
        Command::new().unsafe_append("printf partial > out.txt; exit 5"),
    )
    .unwrap()
    .output_capture("out.txt")
    .unwrap();

    let result = executor().execute(boxed).await.unwrap();
    assert_eq!(result.exit_code, Some(5));
    assert!(!result.success());
    assert_eq!(result.file_contents_str("out.txt").unwrap(), "partial");
}

#[tokio::test]
async fn stdin_is_never_passed_through_in_a_box() {
    let mut command = Command::new().arg("cat").stdin_bytes("boxed bytes");
    command = command.pass_stdin();
    let boxed = BoxedCommand::new("echo", command).unwrap();

    // pass_stdin is force-disabled; the buffered bytes still arrive.
    let result = executor().execute(boxed).await.unwrap();
    assert_eq!(result.stdout, "boxed bytes");
}
