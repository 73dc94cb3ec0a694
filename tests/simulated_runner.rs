use luksbak::runner::{
    CommandSpec, Invocation, OutputSink, ProcessRunner, ScriptedResult, SimulatedRunner,
    check_dependencies,
};
use tokio::sync::mpsc;

#[tokio::test]
async fn scripted_results_pop_in_order() {
    let (runner, controller) = SimulatedRunner::new();
    controller.push_result(ScriptedResult::exit(2));
    controller.push_result(ScriptedResult::ok());

    let first = runner.run(CommandSpec::new("umount")).await.unwrap();
    let second = runner.run(CommandSpec::new("cryptsetup")).await.unwrap();

    assert_eq!(first.code(), Some(2));
    assert!(second.success());
    assert_eq!(controller.programs(), vec!["umount", "cryptsetup"]);
}

#[tokio::test]
async fn empty_script_defaults_to_success() {
    let (runner, _controller) = SimulatedRunner::new();
    let status = runner.run(CommandSpec::new("mount")).await.unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn capture_returns_scripted_stdout() {
    let (runner, controller) = SimulatedRunner::new();
    controller.push_result(ScriptedResult::ok().with_stdout("4096\ttotal\n"));

    let captured = runner
        .capture(CommandSpec::new("du").arg("-sbc"))
        .await
        .unwrap();
    assert!(captured.status.success());
    assert_eq!(captured.stdout, "4096\ttotal\n");
}

#[tokio::test]
async fn run_with_input_records_the_bytes() {
    let (runner, controller) = SimulatedRunner::new();

    runner
        .run_with_input(CommandSpec::new("gpg"), b"secret")
        .await
        .unwrap();

    match &controller.calls()[0] {
        Invocation::RunWithInput { spec, input } => {
            assert_eq!(spec.program, "gpg");
            assert_eq!(input, b"secret");
        }
        other => panic!("expected RunWithInput, got {other:?}"),
    }
}

#[tokio::test]
async fn streaming_delivers_scripted_lines() {
    let (runner, controller) = SimulatedRunner::new();
    controller.push_result(ScriptedResult::ok().with_stream_lines(["  1,024  10%", "  2,048  20%"]));

    let (tx, mut rx) = mpsc::channel(8);
    let status = runner
        .run_streaming(CommandSpec::new("rsync"), tx)
        .await
        .unwrap();

    let mut received = Vec::new();
    while let Some(line) = rx.recv().await {
        received.push(line);
    }
    assert!(status.success());
    assert_eq!(received, vec!["  1,024  10%", "  2,048  20%"]);
}

#[tokio::test]
async fn pipeline_writes_its_file_sink() {
    let tmp = tempfile::tempdir().unwrap();
    let target = tmp.path().join("archive.tar.gz");

    let (runner, controller) = SimulatedRunner::new();
    controller.push_result(ScriptedResult::ok().with_stdout("archive bytes"));

    let outcome = runner
        .pipeline(
            vec![
                CommandSpec::new("tar"),
                CommandSpec::new("pv"),
                CommandSpec::new("gzip"),
            ],
            OutputSink::File(target.clone()),
        )
        .await
        .unwrap();

    assert!(outcome.success());
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "archive bytes");
}

#[tokio::test]
async fn failed_pipeline_names_a_stage() {
    let (runner, controller) = SimulatedRunner::new();
    controller.push_result(ScriptedResult::exit(2));

    let outcome = runner
        .pipeline(
            vec![CommandSpec::new("tar"), CommandSpec::new("gzip")],
            OutputSink::Inherit,
        )
        .await
        .unwrap();

    assert!(!outcome.success());
    assert_eq!(outcome.failed_stage.as_deref(), Some("gzip"));
    assert_eq!(outcome.status.code(), Some(2));
}

#[tokio::test]
async fn missing_tool_is_a_spawn_error() {
    let (runner, controller) = SimulatedRunner::new();
    controller.push_result(ScriptedResult::not_found());

    let err = runner.run(CommandSpec::new("pv")).await.unwrap_err();
    assert!(err.to_string().contains("pv"));
}

#[tokio::test]
async fn dependency_check_lists_every_missing_tool() {
    let (runner, controller) = SimulatedRunner::new();
    controller.push_result(ScriptedResult::ok()); // cryptsetup
    controller.push_result(ScriptedResult::not_found()); // pv
    controller.push_result(ScriptedResult::exit(255)); // scp: no --version flag
    controller.push_result(ScriptedResult::not_found()); // rsync

    let err = check_dependencies(&runner, &["cryptsetup", "pv", "scp", "rsync"])
        .await
        .unwrap_err();
    assert_eq!(err.missing, vec!["pv", "rsync"]);
}

#[tokio::test]
async fn dependency_check_passes_when_everything_spawns() {
    let (runner, controller) = SimulatedRunner::new();
    assert!(check_dependencies(&runner, &["tar", "gzip"]).await.is_ok());
    assert_eq!(controller.programs(), vec!["tar", "gzip"]);
}
