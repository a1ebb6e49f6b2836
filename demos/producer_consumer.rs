//! Producer-Consumer example over a FIFO queue
//!
//! A slow consumer exercises queue backpressure: once the queue is full
//! the producer blocks on the space semaphore until a pop frees a slot.

#![cfg_attr(target_arch = "arm", no_std, no_main)]
#![allow(static_mut_refs)]

#[cfg(target_arch = "arm")]
mod demo {
    use core::sync::atomic::{AtomicU32, Ordering};

    use cortex_m_rt::entry;
    use corten::info;
    use corten::os_task_create;
    use corten::queue::OsFifoQueue;
    use corten::task::OsTcb;
    use corten::time::os_time_dly;
    use corten::types::OsStkElement;

    static PRODUCED: AtomicU32 = AtomicU32::new(0);
    static CONSUMED: AtomicU32 = AtomicU32::new(0);

    static QUEUE: OsFifoQueue<u32, 8> = OsFifoQueue::new();

    static mut PRODUCER_STK: [OsStkElement; 256] = [0; 256];
    static mut PRODUCER_TCB: OsTcb = OsTcb::new();
    static mut CONSUMER_STK: [OsStkElement; 256] = [0; 256];
    static mut CONSUMER_TCB: OsTcb = OsTcb::new();

    fn producer_task(_arg: *mut ()) {
        loop {
            let n = PRODUCED.fetch_add(1, Ordering::Relaxed) + 1;
            let _ = QUEUE.push(n);
            info!("[P] produced #{}", n);
            let _ = os_time_dly(50);
        }
    }

    fn consumer_task(_arg: *mut ()) {
        loop {
            if let Ok(n) = QUEUE.pop() {
                CONSUMED.fetch_add(1, Ordering::Relaxed);
                info!("[C] consumed #{}", n);
            }
            let _ = os_time_dly(200);
        }
    }

    #[entry]
    fn main() -> ! {
        info!("Producer-Consumer Demo");

        corten::os_init().expect("kernel init failed");
        QUEUE.create().unwrap();

        unsafe {
            os_task_create(&mut PRODUCER_TCB, &mut PRODUCER_STK, "P", producer_task, 5).unwrap();
            os_task_create(&mut CONSUMER_TCB, &mut CONSUMER_STK, "C", consumer_task, 10).unwrap();
        }

        info!("Starting...");
        corten::os_start().expect("kernel start failed");

        loop {
            cortex_m::asm::wfi();
        }
    }
}

#[cfg(not(target_arch = "arm"))]
fn main() {}
