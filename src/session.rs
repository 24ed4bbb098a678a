// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 追踪会话 (Tracking session)
//! 职责: 组合流水线与状态机,把 FrameResult 喂给状态机,完成的记录交给持久化接口

use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::config::GolfConfig;
use crate::error::Result;
use crate::inference::InferenceEngine;
use crate::pipeline::{
    FrameAdmission, FrameRequest, PipelineCoordinator, PipelineEvent, PipelineHealth,
};
use crate::shot::{ShotEvent, ShotLifecycleController, ShotRecord, ShotRecordSink};

pub struct ShotSession {
    coordinator: PipelineCoordinator,
    controller: ShotLifecycleController,
    sink: Option<Box<dyn ShotRecordSink + Send>>,
    completed: Vec<ShotRecord>,
}

impl ShotSession {
    pub fn new(config: GolfConfig) -> Self {
        let controller =
            ShotLifecycleController::new(config.shot.clone(), config.calibration.clone());
        Self {
            coordinator: PipelineCoordinator::new(config),
            controller,
            sink: None,
            completed: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ShotRecordSink + Send>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn initialize(&mut self, engine: Box<dyn InferenceEngine>) -> Result<()> {
        self.coordinator.initialize(engine)
    }

    pub fn submit(&mut self, frame: FrameRequest) -> Result<FrameAdmission> {
        self.coordinator.process_frame(frame)
    }

    /// 提交一帧; 被接收时等待其结果并喂给状态机
    pub fn submit_and_wait(
        &mut self,
        frame: FrameRequest,
        timeout: Duration,
    ) -> Result<(FrameAdmission, Vec<ShotEvent>)> {
        let admission = self.coordinator.process_frame(frame)?;
        let events = if admission.is_accepted() {
            self.pump_timeout(timeout)
        } else {
            self.pump()
        };
        Ok((admission, events))
    }

    pub fn start_tracking(&mut self) -> bool {
        self.controller.start_tracking()
    }

    pub fn stop_tracking(&mut self) -> Vec<ShotEvent> {
        self.controller.stop_tracking()
    }

    pub fn subscribe(&mut self) -> Receiver<ShotEvent> {
        self.controller.subscribe()
    }

    /// 取走当前已到达的全部结果
    pub fn pump(&mut self) -> Vec<ShotEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.coordinator.try_next_event() {
            self.handle(event, &mut events);
        }
        events
    }

    /// 最多等待 `timeout` 拿到一个结果,然后取走其余已到达的结果
    pub fn pump_timeout(&mut self, timeout: Duration) -> Vec<ShotEvent> {
        let mut events = Vec::new();
        if let Some(event) = self.coordinator.next_event_timeout(timeout) {
            self.handle(event, &mut events);
        }
        events.extend(self.pump());
        events
    }

    fn handle(&mut self, event: PipelineEvent, events: &mut Vec<ShotEvent>) {
        let result = match event {
            PipelineEvent::Result(result) => result,
            PipelineEvent::Fault(fault) => {
                debug!("帧{:?} 无结果: {}", fault.frame_id, fault.message);
                return;
            }
        };
        for event in self.controller.process(&result) {
            if let ShotEvent::TrackingComplete(record) = &event {
                if let Some(sink) = self.sink.as_mut() {
                    if let Err(e) = sink.store(record) {
                        warn!("❌ 击球记录保存失败: {:#}", e);
                    }
                }
                self.completed.push(record.as_ref().clone());
            }
            events.push(event);
        }
    }

    /// 本会话已完成的击球
    pub fn completed_shots(&self) -> &[ShotRecord] {
        &self.completed
    }

    pub fn health(&self) -> PipelineHealth {
        self.coordinator.health()
    }

    pub fn coordinator(&mut self) -> &mut PipelineCoordinator {
        &mut self.coordinator
    }

    pub fn controller(&self) -> &ShotLifecycleController {
        &self.controller
    }

    pub fn dispose(&mut self) {
        self.controller.stop_tracking();
        self.coordinator.dispose();
    }
}
