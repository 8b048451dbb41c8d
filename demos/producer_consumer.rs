//! Producer-consumer over a bounded message queue

#![cfg_attr(target_arch = "arm", no_std)]
#![cfg_attr(target_arch = "arm", no_main)]

#[cfg(target_arch = "arm")]
mod demo {
    use cortex_m_rt::entry;
    use defmt::info;
    use macs::{priority, task, MessageQueue, Mode, Task, INFINITE_TIMEOUT};

    // 8 ring slots: up to 7 queued messages.
    static QUEUE: MessageQueue<u32, 8> = MessageQueue::new();

    static mut PRODUCER_TASK: Task = Task::new(Some("producer"), producer_body);
    static mut PRODUCER_STACK: [u32; 256] = [0; 256];
    static mut CONSUMER_TASK: Task = Task::new(Some("consumer"), consumer_body);
    static mut CONSUMER_STACK: [u32; 256] = [0; 256];

    fn producer_body(_: *mut ()) {
        let mut n = 0u32;
        loop {
            n += 1;
            let _ = QUEUE.push(n, INFINITE_TIMEOUT);
            info!("[P] pushed #{}", n);
            let _ = task::delay(200);
        }
    }

    fn consumer_body(_: *mut ()) {
        loop {
            if let Ok(n) = QUEUE.pop(INFINITE_TIMEOUT) {
                info!("[C] popped #{}", n);
            }
            for _ in 0..10_000 {
                cortex_m::asm::nop();
            }
        }
    }

    #[entry]
    fn main() -> ! {
        info!("Producer-Consumer demo");

        macs::initialize().expect("kernel init failed");
        unsafe {
            task::add(
                &mut *(&raw mut PRODUCER_TASK),
                &mut *(&raw mut PRODUCER_STACK),
                priority::BELOW_NORMAL,
                Mode::Unprivileged,
            )
            .unwrap();
            task::add(
                &mut *(&raw mut CONSUMER_TASK),
                &mut *(&raw mut CONSUMER_STACK),
                priority::NORMAL,
                Mode::Unprivileged,
            )
            .unwrap();
        }

        info!("Starting...");
        macs::start(true).expect("kernel start failed");

        loop {
            cortex_m::asm::wfi();
        }
    }
}

#[cfg(not(target_arch = "arm"))]
fn main() {}
