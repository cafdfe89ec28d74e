//! End-to-end behaviour of a hardware session driven through a client

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use keyvox::audio::{chunk_samples, wav};
use keyvox::keypad::layout::codes::KEY_KP5;
use keyvox::{AudioRequest, BeepKind, Error, KeypadPoller, Layout, Status};

mod common;
use common::{Fakes, SAMPLES_PER_CHAR, connected, marker, test_config};

const LONG: &str = "fourteen point two five zero";

#[test]
fn test_repeated_phrase_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let fakes = Fakes::new();
    let (client, session) = connected(
        &config,
        fakes.backends(&config, Duration::from_millis(1), true),
    );

    assert_eq!(client.speak(LONG).unwrap(), Status::Ok);
    assert_eq!(fakes.synth_calls.load(Ordering::SeqCst), 1);

    assert_eq!(client.speak(LONG).unwrap(), Status::Ok);
    assert_eq!(fakes.synth_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        fakes.playback.count_of(LONG),
        2 * LONG.len() * SAMPLES_PER_CHAR
    );

    drop(client);
    session.wait();
}

#[test]
fn test_interrupt_silences_playback_and_next_phrase_plays() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let fakes = Fakes::new();
    let (client, session) = connected(
        &config,
        fakes.backends(&config, Duration::from_millis(20), true),
    );
    let client = Arc::new(client);

    let speaker = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.speak(LONG).unwrap())
    };
    assert!(
        fakes
            .playback
            .wait_for(Duration::from_secs(2), |log| log.count_of(LONG) >= SAMPLES_PER_CHAR)
    );

    assert_eq!(client.interrupt().unwrap(), Status::Ok);
    let at_ack = fakes.playback.count_of(LONG);
    assert_eq!(speaker.join().unwrap(), Status::Interrupted);

    thread::sleep(Duration::from_millis(100));
    let settled = fakes.playback.count_of(LONG);
    let chunk = 800;
    assert!(settled - at_ack <= chunk, "kept playing after interrupt");
    assert!(settled < LONG.len() * SAMPLES_PER_CHAR);
    assert!(fakes.playback.drops() >= 1);

    assert_eq!(client.speak("two").unwrap(), Status::Ok);
    assert_eq!(fakes.playback.count_of("two"), 3 * SAMPLES_PER_CHAR);

    drop(client);
    session.wait();
}

#[test]
fn test_interrupt_drops_device_buffer_and_next_phrase_plays_whole() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let fakes = Fakes::new();
    let period = Duration::from_millis(20);
    let (client, session) = connected(&config, fakes.device_backends(&config, period));
    let client = Arc::new(client);

    // Cached, so the repeat is queued on the device as soon as it is armed
    let two = 3 * SAMPLES_PER_CHAR;
    assert_eq!(client.speak("two").unwrap(), Status::Ok);
    assert!(
        fakes
            .playback
            .wait_for(Duration::from_secs(1), |log| log.count_of("two") == two)
    );

    let speaker = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.speak(LONG).unwrap())
    };
    assert!(
        fakes
            .playback
            .wait_for(Duration::from_secs(2), |log| log.count_of(LONG) >= SAMPLES_PER_CHAR)
    );

    assert_eq!(client.interrupt().unwrap(), Status::Ok);
    let at_ack = fakes.playback.count_of(LONG);
    assert_eq!(client.speak("two").unwrap(), Status::Ok);
    assert_eq!(speaker.join().unwrap(), Status::Interrupted);

    assert!(
        fakes
            .playback
            .wait_for(Duration::from_secs(1), |log| log.count_of("two") == 2 * two)
    );
    let late = fakes.playback.count_of(LONG) - at_ack;
    assert!(
        late <= 2 * chunk_samples(period),
        "{late} buffered samples played after interrupt"
    );
    assert!(fakes.playback.drops() >= 1);

    drop(client);
    session.wait();
}

#[test]
fn test_interrupt_cancels_queued_requests() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let fakes = Fakes::new();
    let (client, session) = connected(
        &config,
        fakes.backends(&config, Duration::from_millis(20), true),
    );

    let playing = client
        .send_audio(&AudioRequest::Speak(LONG.into()))
        .unwrap();
    assert!(
        fakes
            .playback
            .wait_for(Duration::from_secs(2), |log| log.count_of(LONG) > 0)
    );
    let queued_speech = client
        .send_audio(&AudioRequest::Speak("one".into()))
        .unwrap();
    let queued_file = client
        .send_audio(&AudioRequest::PlayFile(dir.path().join("ready")))
        .unwrap();

    assert_eq!(client.interrupt().unwrap(), Status::Ok);
    assert_eq!(
        client.await_audio(queued_speech).unwrap(),
        Status::Interrupted
    );
    assert_eq!(
        client.await_audio(queued_file).unwrap(),
        Status::Interrupted
    );
    assert_eq!(client.await_audio(playing).unwrap(), Status::Interrupted);
    assert_eq!(fakes.playback.count_of("one"), 0);

    drop(client);
    session.wait();
}

#[test]
fn test_beep_bypasses_queue() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let fakes = Fakes::new();
    let (client, session) = connected(
        &config,
        fakes.backends(&config, Duration::from_millis(20), true),
    );
    let client = Arc::new(client);

    // Make sure the audio lane is up before timing anything
    assert_eq!(client.speak("a").unwrap(), Status::Ok);

    let speaker = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.speak(LONG).unwrap())
    };
    assert!(
        fakes
            .playback
            .wait_for(Duration::from_secs(2), |log| log.count_of(LONG) > 0)
    );

    // Answered while the long phrase is still playing
    assert_eq!(client.beep(BeepKind::Hold).unwrap(), Status::Ok);
    let played = fakes.playback.count_of(LONG);
    assert!(played < LONG.len() * SAMPLES_PER_CHAR);
    assert_eq!(speaker.join().unwrap(), Status::Ok);

    drop(client);
    session.wait();
}

#[test]
fn test_file_playback() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let fakes = Fakes::new();
    let (client, session) = connected(
        &config,
        fakes.backends(&config, Duration::from_millis(1), true),
    );

    wav::write_wav(&dir.path().join("ready.wav"), &vec![marker("ready"); 4000]).unwrap();
    let status = client.play_file(&dir.path().join("ready")).unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(fakes.playback.count_of("ready"), 4000);

    assert_eq!(
        client.play_file(&dir.path().join("missing.wav")).unwrap(),
        Status::Failed
    );

    drop(client);
    session.wait();
}

#[test]
fn test_saved_speech_lands_in_pregen_dir_and_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let fakes = Fakes::new();
    let (client, session) = connected(
        &config,
        fakes.backends(&config, Duration::from_millis(1), true),
    );

    let text = "Fourteen point two";
    assert_eq!(client.save_speech(text).unwrap(), Status::Ok);
    assert_eq!(fakes.playback.count_of(text), 0);

    let saved = wav::read_wav(&config.audio.pregen_dir.join("fourteen_point_two.wav")).unwrap();
    assert_eq!(saved.len(), text.len() * SAMPLES_PER_CHAR);

    assert_eq!(client.speak(text).unwrap(), Status::Ok);
    assert_eq!(fakes.synth_calls.load(Ordering::SeqCst), 1);

    drop(client);
    session.wait();
}

#[test]
fn test_missing_audio_device_keeps_keypad_working() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let fakes = Fakes::new();
    let (client, session) = connected(
        &config,
        fakes.backends(&config, Duration::from_millis(1), false),
    );

    assert_eq!(client.speak("two").unwrap(), Status::Failed);
    assert_eq!(client.beep(BeepKind::Error).unwrap(), Status::Failed);

    fakes.keys.tap(KEY_KP5);
    let report = client.read_keypad().unwrap();
    assert_eq!(report.symbol, Some('5'));

    drop(client);
    session.wait();
}

#[test]
fn test_keypad_reads() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let fakes = Fakes::new();
    let (client, session) = connected(
        &config,
        fakes.backends(&config, Duration::from_millis(1), true),
    );

    assert_eq!(client.read_keypad().unwrap().symbol, None);

    fakes.keys.tap(KEY_KP5);
    let report = client.read_keypad().unwrap();
    assert_eq!(report.symbol, Some('5'));
    assert!(!report.is_hold);
    assert_eq!(client.read_keypad().unwrap().symbol, None);

    drop(client);
    session.wait();
}

#[test]
fn test_poller_forwards_key_events() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let fakes = Fakes::new();
    let (client, session) = connected(
        &config,
        fakes.backends(&config, Duration::from_millis(1), true),
    );
    let client = Arc::new(client);

    let (key_tx, key_rx) = std::sync::mpsc::channel();
    let mut poller = KeypadPoller::start(
        Arc::clone(&client),
        Duration::from_millis(10),
        false,
        move |report| {
            let _ = key_tx.send(report);
        },
    )
    .unwrap();

    fakes.keys.tap(KEY_KP5);
    let report = key_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(report.symbol, Some('5'));
    assert!(!report.is_hold);
    assert!(!poller.is_finished());

    poller.stop();
    assert!(poller.is_finished());
    drop(client);
    session.wait();
}

#[test]
fn test_runtime_settings() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let fakes = Fakes::new();
    let (client, session) = connected(
        &config,
        fakes.backends(&config, Duration::from_millis(1), true),
    );

    assert_eq!(client.set_layout(Layout::Phone).unwrap(), Status::Ok);
    assert_eq!(client.set_volume(40).unwrap(), Status::Ok);
    assert!(matches!(client.set_volume(101), Err(Error::Config(_))));
    assert_eq!(client.set_speech_speed(150).unwrap(), Status::Ok);
    assert_eq!(*fakes.speeds.lock().unwrap(), vec![150]);

    drop(client);
    session.wait();
}

#[test]
fn test_session_ends_when_application_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let fakes = Fakes::new();
    let (client, session) = connected(
        &config,
        fakes.backends(&config, Duration::from_millis(1), true),
    );

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let waiter = thread::spawn(move || {
        session.wait();
        let _ = done_tx.send(());
    });

    drop(client);
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    waiter.join().unwrap();
}
