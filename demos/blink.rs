//! Two tasks blinking virtual LEDs at different rates

#![cfg_attr(target_arch = "arm", no_std)]
#![cfg_attr(target_arch = "arm", no_main)]

#[cfg(target_arch = "arm")]
mod demo {
    use core::sync::atomic::{AtomicBool, Ordering};

    use cortex_m_rt::entry;
    use defmt::info;
    use macs::{priority, task, Mode, Task};

    static LED_FAST: AtomicBool = AtomicBool::new(false);
    static LED_SLOW: AtomicBool = AtomicBool::new(false);

    static mut FAST_TASK: Task = Task::new(Some("fast"), fast_body);
    static mut FAST_STACK: [u32; 256] = [0; 256];
    static mut SLOW_TASK: Task = Task::new(Some("slow"), slow_body);
    static mut SLOW_STACK: [u32; 256] = [0; 256];

    fn fast_body(_: *mut ()) {
        loop {
            let on = !LED_FAST.load(Ordering::Relaxed);
            LED_FAST.store(on, Ordering::Relaxed);
            info!("[fast] led {}", on);
            let _ = task::delay(100);
        }
    }

    fn slow_body(_: *mut ()) {
        loop {
            let on = !LED_SLOW.load(Ordering::Relaxed);
            LED_SLOW.store(on, Ordering::Relaxed);
            info!("[slow] led {}", on);
            let _ = task::delay(500);
        }
    }

    #[entry]
    fn main() -> ! {
        info!("Blink demo");

        macs::initialize().expect("kernel init failed");
        unsafe {
            task::add(
                &mut *(&raw mut FAST_TASK),
                &mut *(&raw mut FAST_STACK),
                priority::NORMAL,
                Mode::Unprivileged,
            )
            .unwrap();
            task::add(
                &mut *(&raw mut SLOW_TASK),
                &mut *(&raw mut SLOW_STACK),
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
