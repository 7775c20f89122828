#[cfg(windows)]
fn main() {
    use std::sync::Arc;
    use std::time::Duration;

    use ferrisbeat::{sink, Consumer, ConsumerConfig, SessionConfig};

    // Session state changes and native failures are logged through `log`
    env_logger::init();

    let config = ConsumerConfig {
        sessions: vec![
            SessionConfig::new("ferrisbeat-kernel-process")
                .provider("{22FB2CD6-0E7B-422B-A0C7-2FAD1FD0E716}") // Microsoft-Windows-Kernel-Process
                .trace_level("information"),
            SessionConfig::new("ferrisbeat-powershell")
                .provider("{A0C1853B-5C40-4B15-8766-3CF1C58F985A}") // Microsoft-Windows-PowerShell
                .trace_level("verbose"),
        ],
    };

    let (pipeline, records) = sink::channel();
    let consumer = Arc::new(Consumer::new(config, Arc::new(pipeline)));

    let runner = {
        let consumer = Arc::clone(&consumer);
        std::thread::spawn(move || consumer.run())
    };

    let printer = std::thread::spawn(move || {
        for record in records.iter() {
            println!(
                "[{}] {} event {} (level {}) from PID {}",
                record.session,
                record.provider_id,
                record.event_id,
                record.level_name().unwrap_or("?"),
                record.process_id
            );
        }
    });

    std::thread::sleep(Duration::new(20, 0));
    consumer.stop();

    for report in runner.join().unwrap() {
        println!(
            "{}: {:?} after {} event(s)",
            report.name,
            report.final_state(),
            report.events_handled
        );
    }
    // Dropping the consumer drops the pipeline, and ends the printer
    drop(consumer);
    printer.join().unwrap();
}

#[cfg(not(windows))]
fn main() {
    eprintln!("This demo runs real ETW sessions, it only works on Windows");
}
