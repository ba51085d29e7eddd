use crate::config::{LossFunction, RegistrationOptions};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustLoss {
    pub function: LossFunction,
    /// Kernel scale, in the unit of the residual.
    pub sigma: f64,
    pub tolerant_min_threshold: f64,
    pub outlier_distance: f64,
}

impl RobustLoss {
    pub fn new(options: &RegistrationOptions) -> RobustLoss {
        RobustLoss {
            function: options.loss_function,
            sigma: options.ls_sigma,
            tolerant_min_threshold: options.ls_tolerant_min_threshold,
            outlier_distance: options.outlier_distance,
        }
    }

    /// Weight of a residual of norm `residual`.
    #[inline]
    pub fn weight(&self, residual: f64) -> f64 {
        let cauchy = |r: f64| 1.0 / (1.0 + (r / self.sigma).powi(2));
        match self.function {
            LossFunction::Standard => 1.0,
            LossFunction::Cauchy => cauchy(residual),
            LossFunction::Huber => {
                if residual <= self.sigma {
                    1.0
                } else {
                    self.sigma / residual
                }
            }
            LossFunction::Tolerant => cauchy(residual).max(self.tolerant_min_threshold),
            LossFunction::Truncated => {
                if residual > self.outlier_distance {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }
}
