//! Priority inheritance demo
//!
//! Three tasks: high (50), medium (30), low (10). The low task holds a
//! mutex the high task wants; while the high task waits, the low owner is
//! boosted past the CPU-bound medium task.

#![cfg_attr(target_arch = "arm", no_std)]
#![cfg_attr(target_arch = "arm", no_main)]

#[cfg(target_arch = "arm")]
mod demo {
    use core::sync::atomic::{AtomicU32, Ordering};

    use cortex_m_rt::entry;
    use defmt::info;
    use macs::{priority, task, Mode, Mutex, Task, INFINITE_TIMEOUT};

    static HIGH_RUNS: AtomicU32 = AtomicU32::new(0);
    static LOW_RUNS: AtomicU32 = AtomicU32::new(0);

    static MTX: Mutex = Mutex::new();

    static mut HIGH_TASK: Task = Task::new(Some("high"), high_body);
    static mut HIGH_STACK: [u32; 256] = [0; 256];
    static mut MED_TASK: Task = Task::new(Some("med"), med_body);
    static mut MED_STACK: [u32; 256] = [0; 256];
    static mut LOW_TASK: Task = Task::new(Some("low"), low_body);
    static mut LOW_STACK: [u32; 256] = [0; 256];

    fn high_body(_: *mut ()) {
        let _ = task::delay(50);
        loop {
            let n = HIGH_RUNS.fetch_add(1, Ordering::Relaxed) + 1;

            let _ = MTX.lock(INFINITE_TIMEOUT);
            info!("[HIGH] acquired #{}", n);
            for _ in 0..1_000 {
                cortex_m::asm::nop();
            }
            let _ = MTX.unlock();

            let _ = task::delay(100);
        }
    }

    fn med_body(_: *mut ()) {
        loop {
            for _ in 0..50_000 {
                cortex_m::asm::nop();
            }
            let _ = task::delay(10);
        }
    }

    fn low_body(_: *mut ()) {
        loop {
            let n = LOW_RUNS.fetch_add(1, Ordering::Relaxed) + 1;

            let _ = MTX.lock(INFINITE_TIMEOUT);
            info!("[LOW] holding #{}", n);
            for _ in 0..100_000 {
                cortex_m::asm::nop();
            }
            let _ = MTX.unlock();

            let _ = task::delay(200);
        }
    }

    #[entry]
    fn main() -> ! {
        info!("Priority inversion demo: H(50) M(30) L(10)");

        macs::initialize().expect("kernel init failed");
        unsafe {
            task::add(
                &mut *(&raw mut LOW_TASK),
                &mut *(&raw mut LOW_STACK),
                priority::LOW,
                Mode::Unprivileged,
            )
            .unwrap();
            task::add(
                &mut *(&raw mut MED_TASK),
                &mut *(&raw mut MED_STACK),
                priority::NORMAL,
                Mode::Unprivileged,
            )
            .unwrap();
            task::add(
                &mut *(&raw mut HIGH_TASK),
                &mut *(&raw mut HIGH_STACK),
                priority::HIGH,
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
