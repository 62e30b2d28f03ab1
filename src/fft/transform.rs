use crate::device::{Accelerator, TransformDesc, TransformHooks, TransformLayout};
use crate::error::{ComputeError, Result};
use std::sync::Arc;

/// Fixed-batch forward transform plan, released on drop.
pub struct TransformPlan<A: Accelerator> {
    device: Arc<A>,
    plan: Option<A::Plan>,
    desc: TransformDesc,
}

impl<A: Accelerator> TransformPlan<A> {
    #[inline]
    pub fn length(&self) -> usize {
        self.desc.length
    }

    /// Lanes per execution; buffers must hold at least `batch * length` points.
    #[inline]
    pub fn batch(&self) -> usize {
        self.desc.batch
    }

    #[inline]
    pub fn desc(&self) -> &TransformDesc {
        &self.desc
    }

    pub fn enqueue(
        &self,
        queue: &A::Queue,
        input: &A::Mem,
        output: &A::Mem,
        wait: &[A::Event],
    ) -> Result<A::Event> {
        match &self.plan {
            Some(plan) => self.device.enqueue_transform(queue, plan, input, output, wait),
            None => Err(ComputeError::Device("transform plan already released".into())),
        }
    }
}

impl<A: Accelerator> Drop for TransformPlan<A> {
    fn drop(&mut self) {
        if let Some(plan) = self.plan.take() {
            self.device.release_plan(plan);
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransformPlanBuilder {
    length: usize,
    batch: usize,
    layout: TransformLayout,
    hooks: Option<TransformHooks>,
}

impl TransformPlanBuilder {
    pub fn new(length: usize, batch: usize) -> Self {
        Self { length, batch, layout: TransformLayout::OutOfPlace, hooks: None }
    }

    pub fn layout(mut self, layout: TransformLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Per-element callbacks fused into the transform. Backends without
    /// callback support reject the plan with `Unsupported`.
    pub fn hooks(mut self, hooks: TransformHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build<A: Accelerator>(
        self,
        device: &Arc<A>,
        queue: &A::Queue,
    ) -> Result<TransformPlan<A>> {
        if self.hooks.is_some() && !device.supports_transform_hooks() {
            return Err(ComputeError::Unsupported("transform callback hooks".into()));
        }
        let desc = TransformDesc {
            length: self.length,
            batch: self.batch,
            layout: self.layout,
            hooks: self.hooks,
        };
        let plan = device.create_transform_plan(queue, &desc)?;
        Ok(TransformPlan { device: device.clone(), plan: Some(plan), desc })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::host::HostAccelerator;

    #[test]
    fn plan_is_released_on_drop() {
        let dev = Arc::new(HostAccelerator::default());
        let q = dev.create_queue().unwrap();
        let plan = TransformPlanBuilder::new(64, 4).build(&dev, &q).unwrap();
        assert_eq!((plan.length(), plan.batch()), (64, 4));
        drop(plan);
        let s = dev.object_stats();
        assert_eq!((s.plans_created, s.plans_released), (1, 1));
    }

    #[test]
    fn hooks_are_unsupported_on_host() {
        let dev = Arc::new(HostAccelerator::default());
        let q = dev.create_queue().unwrap();
        let hooks = TransformHooks { pre: Some("pad".into()), post: None };
        let err = TransformPlanBuilder::new(64, 1).hooks(hooks).build(&dev, &q);
        assert!(matches!(err, Err(ComputeError::Unsupported(_))));
    }
}
