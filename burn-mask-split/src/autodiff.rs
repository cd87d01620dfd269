//! # Autodiff integration
//!
//! Registers the fused split with Burn's autodiff graph. The forward pass runs the inner
//! backend's kernel once; the sum and pow blocks each get their own node, so a loss that
//! reads only one of them runs the matching single-block gradient kernel. The count block
//! does not depend on the image and is left untracked. The label map only selects
//! classes, so it receives a zero gradient.

use burn::{
    backend::autodiff::{
        checkpoint::{base::Checkpointer, strategy::CheckpointStrategy},
        grads::Gradients,
        ops::{Backward, Ops, OpsKind},
        Autodiff, NodeID,
    },
    prelude::*,
    tensor::{backend::AutodiffBackend, ops::FloatTensor, TensorPrimitive},
};

use crate::{
    backend::MaskSplitBackend,
    labels::ClassLut,
    split::{Connection, UpstreamGrad},
};

#[derive(Debug)]
struct SplitBlockBackward {
    lut: ClassLut,
    /// `Sum` or `Pow`.
    block: Connection,
}

impl<B: MaskSplitBackend> Backward<B, 2> for SplitBlockBackward {
    type State = (NodeID, NodeID);

    fn backward(
        self,
        ops: Ops<Self::State, 2>,
        grads: &mut Gradients,
        checkpointer: &mut Checkpointer,
    ) {
        let [node_labels, node_image] = ops.parents;
        let grad = grads.consume::<B>(&ops.node);

        let (labels_state, image_state) = ops.state;
        let labels: FloatTensor<B> = checkpointer.retrieve_node_output(labels_state);
        let image: FloatTensor<B> = checkpointer.retrieve_node_output(image_state);

        if let Some(node) = node_image {
            let upstream = match self.block {
                Connection::Pow => UpstreamGrad::Pow(grad),
                _ => UpstreamGrad::Sum(grad),
            };
            let grad_image = B::mask_split_grad(labels.clone(), image, upstream, &self.lut);
            grads.register::<B>(node.id, grad_image);
        }

        if let Some(node) = node_labels {
            let zeros = Tensor::<B, 4>::from_primitive(TensorPrimitive::Float(labels))
                .zeros_like()
                .into_primitive()
                .tensor();
            grads.register::<B>(node.id, zeros);
        }
    }
}

fn track_block<B: MaskSplitBackend, C: CheckpointStrategy>(
    backward: SplitBlockBackward,
    labels: &FloatTensor<Autodiff<B, C>>,
    image: &FloatTensor<Autodiff<B, C>>,
    output: FloatTensor<B>,
) -> FloatTensor<Autodiff<B, C>> {
    let prep = backward
        .prepare::<C>([labels.node.clone(), image.node.clone()])
        .compute_bound()
        .stateful();

    match prep {
        OpsKind::Tracked(mut prep) => {
            let labels_state = prep.checkpoint(labels);
            let image_state = prep.checkpoint(image);
            prep.finish((labels_state, image_state), output)
        }
        OpsKind::UnTracked(prep) => prep.finish(output),
    }
}

impl<B: MaskSplitBackend, C: CheckpointStrategy> MaskSplitBackend for Autodiff<B, C> {
    const ACCELERATED: bool = B::ACCELERATED;

    fn mask_split(
        labels: FloatTensor<Self>,
        image: FloatTensor<Self>,
        staging: FloatTensor<Self>,
        lut: &ClassLut,
    ) -> [FloatTensor<Self>; 3] {
        let [sum, pow, count] = B::mask_split(
            labels.primitive.clone(),
            image.primitive.clone(),
            staging.primitive,
            lut,
        );

        let block = |block| SplitBlockBackward {
            lut: lut.clone(),
            block,
        };
        let sum = track_block::<B, C>(block(Connection::Sum), &labels, &image, sum);
        let pow = track_block::<B, C>(block(Connection::Pow), &labels, &image, pow);
        let count = <Self as AutodiffBackend>::from_inner(count);

        [sum, pow, count]
    }
}
