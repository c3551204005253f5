/// Learning rate multiplied by `decay_rate` once every `decay_steps` steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialDecay {
    pub starter: f64,
    pub decay_steps: usize,
    pub decay_rate: f64,
}

impl ExponentialDecay {
    pub fn learning_rate(&self, step: usize) -> f64 {
        let decays = step / self.decay_steps.max(1);

        self.starter * self.decay_rate.powi(decays as i32)
    }
}
