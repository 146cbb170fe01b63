#![no_main]
#![no_std]

use defmt_rtt as _;
use panic_probe as _;

use core::sync::atomic::{AtomicBool, Ordering};

use hal::{
    self,
    clocks::Clocks,
    dma::{self, Dma, DmaChannel},
    gpio::Pin,
    pac,
    pac::{DMA1, TIM7},
    timer::{Timer, TimerInterrupt},
};

use meltybrain_algo::{
    analog::{Battery, BatteryStatus},
    config::{
        ACCEL_ADDR_A, ACCEL_ADDR_B, ACCEL_OFFSET_SAMPLES, ACCEL_RADIUS_M, BATTERY_SAMPLE_DIVIDER,
        CONTROL_LOOP_HZ,
    },
    drive::{Drivetrain, RobotMode},
    input::{
        CommandExchange, CommandPublisher, CommandReader, CommandSubscriber, ControlDecoder,
        LinkEvent,
    },
    settings::Settings,
    RobotController, TickInputs,
};

use meltybrain_drivers::wave_out::{EscOutputA, EscOutputB, PixelOutput, ESC_SLOTS, PIXEL_SLOTS};

use cortex_m;

type Outputs = Drivetrain<EscOutputA, EscOutputB, PixelOutput>;

/// Spin running or requested on the latest control tick
static SPIN_ARMED: AtomicBool = AtomicBool::new(false);
/// Set by the writer when a queued image did not reach flash
static SAVE_RETRY: AtomicBool = AtomicBool::new(false);

#[rtic::app(device = pac, peripherals = true, dispatchers = [SPI3])]
mod app {
    use super::*;

    use meltybrain_drivers::*;

    #[shared]
    struct Shared {
        battery_status: BatteryStatus,
    }

    #[local]
    struct Local {
        control_timer: Timer<TIM7>,
        clock: clock::DwtClock,
        status_led: Pin,
        reader: CommandReader,
        subscriber: CommandSubscriber<'static>,
        robot: RobotController,
        settings: Settings,
        accels: accel_i2c::AccelPair,
        dma1: Dma<DMA1>,
        drivetrain: Outputs,
        link: link_uart::LinkUart,
        publisher: CommandPublisher<'static>,
        decoder: ControlDecoder,
        battery_adc: battery_adc::BatteryAdc,
        battery: Battery,
        flash: settings_flash::SettingsFlash,
    }

    #[init(local = [
        exchange: CommandExchange = CommandExchange::new(),
        esc_a_slots: [u16; ESC_SLOTS] = [0; ESC_SLOTS],
        esc_b_slots: [u16; ESC_SLOTS] = [0; ESC_SLOTS],
        pixel_slots: [u16; PIXEL_SLOTS] = [0; PIXEL_SLOTS],
    ])]
    fn init(ctx: init::Context) -> (Shared, Local) {
        let dp = ctx.device;
        let mut cp = ctx.core;
        let clock_cfg = Clocks::default();
        clock_cfg.setup().unwrap();

        let sysclk_freq = clock_cfg.sysclk(); // System clock frequency in Hz
        defmt::debug!("SYSTEM: Clock frequency is {} MHz", sysclk_freq / 1000000);
        let clock = clock::DwtClock::new(&mut cp.DCB, &mut cp.DWT, sysclk_freq);

        let mut status_led = pinout::indicator::STATUS.init();
        status_led.set_high();

        // Settings first: the decoder restores its ladder position and trim from them
        let mut flash = settings_flash::SettingsFlash::new(dp.FLASH);
        let settings = flash.load();

        // Outputs, all three lines on DMA1 through the request mux
        let dma1 = Dma::new(dp.DMA1);
        dma::enable_mux1();
        let esc_a = EscOutputA::new(dp.TIM3, DmaChannel::C1, ctx.local.esc_a_slots, &clock_cfg);
        let esc_b = EscOutputB::new(dp.TIM4, DmaChannel::C2, ctx.local.esc_b_slots, &clock_cfg);
        let pixels = PixelOutput::new(dp.TIM2, DmaChannel::C3, ctx.local.pixel_slots, &clock_cfg);
        let mut drivetrain = Drivetrain::new(esc_a, esc_b, pixels);
        drivetrain.stop();
        drivetrain.show();

        // Accelerometers share I2C1
        let accels = accel_i2c::AccelPair::new(dp.I2C1, &clock_cfg, ACCEL_ADDR_A, ACCEL_ADDR_B);
        let mut robot = RobotController::new(ACCEL_RADIUS_M);
        {
            let (mut accel_a, mut accel_b) = accels.sensors();
            if let Err(e) = accel_a.init() {
                defmt::error!("accel A init failed: {}", e);
            }
            if let Err(e) = accel_b.init() {
                defmt::error!("accel B init failed: {}", e);
            }

            // Robot must be at rest and upright during power-up
            let mut attempts = 0;
            while !robot.calibrate_offset(&mut accel_a, &mut accel_b) {
                attempts += 1;
                if attempts >= 2 * ACCEL_OFFSET_SAMPLES {
                    defmt::error!("accel offset calibration gave up, offsets left at zero");
                    break;
                }
                cortex_m::asm::delay(sysclk_freq / 1000);
            }
        }

        // Input path: link UART feeds the exchange, the control loop reads it
        let (publisher, subscriber) = ctx.local.exchange.split();
        let decoder = ControlDecoder::new(&settings);
        let link = link_uart::LinkUart::new(dp.USART2, &clock_cfg);

        let battery_adc = battery_adc::BatteryAdc::new(dp.ADC1, clock_cfg.systick());

        let mut control_timer = Timer::new_tim7(
            dp.TIM7,
            CONTROL_LOOP_HZ as f32,
            Default::default(),
            &clock_cfg,
        );
        control_timer.enable_interrupt(TimerInterrupt::Update);
        control_timer.enable();
        defmt::info!("SYSTEM: control loop at {} Hz", CONTROL_LOOP_HZ);

        (
            Shared {
                battery_status: BatteryStatus::UNKNOWN,
            },
            Local {
                control_timer,
                clock,
                status_led,
                reader: CommandReader::new(),
                subscriber,
                robot,
                settings,
                accels,
                dma1,
                drivetrain,
                link,
                publisher,
                decoder,
                battery_adc,
                battery: Battery::new(),
                flash,
            },
        )
    }

    #[task(
        binds = TIM7,
        priority = 3,
        shared = [battery_status],
        local = [
            control_timer, clock, status_led, reader, subscriber, robot, settings, accels, dma1,
            drivetrain, ticks: u32 = 0
        ]
    )]
    fn control_loop(mut cx: control_loop::Context) {
        // Clear the update interrupt flag
        cx.local
            .control_timer
            .clear_interrupt(TimerInterrupt::Update);

        let now_us = cx.local.clock.now_us();
        let command = *cx.local.reader.tick(cx.local.subscriber, now_us / 1000);
        let battery = cx.shared.battery_status.lock(|status| *status);
        let inputs = TickInputs {
            now_us,
            command: &command,
            battery,
        };

        let robot = cx.local.robot;
        let settings = cx.local.settings;
        let (mut accel_a, mut accel_b) = cx.local.accels.sensors();
        let mode = robot.tick(
            &inputs,
            &mut accel_a,
            &mut accel_b,
            cx.local.drivetrain,
            settings,
        );
        SPIN_ARMED.store(
            mode == RobotMode::Spinning || command.spin_requested,
            Ordering::Release,
        );
        if SAVE_RETRY.swap(false, Ordering::AcqRel) {
            settings.mark_dirty();
        }

        *cx.local.ticks = cx.local.ticks.wrapping_add(1);
        let ticks = *cx.local.ticks;
        if ticks % BATTERY_SAMPLE_DIVIDER == 0 {
            battery_sample::spawn().ok();
        }
        if ticks % (CONTROL_LOOP_HZ / 2) == 0 {
            cx.local.status_led.toggle();
        }
        if ticks % CONTROL_LOOP_HZ == 0 {
            if mode == RobotMode::Spinning {
                defmt::debug!("SPIN: {} rpm", robot.last_rpm());
            }
            // Flash erase stalls the core, so only once spin has been off for a while
            if settings.is_dirty()
                && robot.is_settled(now_us)
                && persist_settings::spawn(*settings).is_ok()
            {
                settings.mark_clean();
            }
        }
    }

    #[task(binds = USART2, priority = 2, local = [link, publisher, decoder])]
    fn link_rx(cx: link_rx::Context) {
        match cx.local.link.on_interrupt() {
            Ok(Some(LinkEvent::Sample(sample))) => {
                let decoder = cx.local.decoder;
                cx.local
                    .publisher
                    .publish_with(|out| decoder.decode(&sample, out));
            }
            Ok(Some(LinkEvent::Connected)) => {
                defmt::info!("LINK: controller paired");
                cx.local.publisher.set_connected(true);
            }
            Ok(Some(LinkEvent::Disconnected)) => {
                defmt::warn!("LINK: controller lost");
                cx.local.publisher.set_connected(false);
            }
            Ok(None) => {}
            Err(e) => {
                defmt::warn!("LINK: {} ({} rejected)", e, cx.local.link.errors());
            }
        }
    }

    #[task(priority = 1, shared = [battery_status], local = [battery_adc, battery])]
    async fn battery_sample(mut cx: battery_sample::Context) {
        let raw = cx.local.battery_adc.read();
        let status = cx.local.battery.tick(raw);
        let previous = cx
            .shared
            .battery_status
            .lock(|shared| core::mem::replace(shared, status));
        if previous != status {
            defmt::debug!(
                "BATTERY: {} mV, {}%",
                cx.local.battery.voltage_mv(),
                status.percent
            );
        }
    }

    #[task(priority = 1, local = [flash])]
    async fn persist_settings(cx: persist_settings::Context, image: Settings) {
        // Armed again since the write was queued
        if SPIN_ARMED.load(Ordering::Acquire) {
            defmt::warn!("SETTINGS: robot armed, write deferred");
            SAVE_RETRY.store(true, Ordering::Release);
            return;
        }
        match cx.local.flash.store(&image) {
            Ok(()) => defmt::info!("SETTINGS: saved"),
            Err(e) => {
                defmt::error!("SETTINGS: write failed: {}", e);
                SAVE_RETRY.store(true, Ordering::Release);
            }
        }
    }
}

#[defmt::panic_handler]
fn panic() -> ! {
    cortex_m::asm::udf()
}
